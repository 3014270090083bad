use std::fs;
use std::path::Path;

const CONFIG_DEFINES: &[(&str, &str)] = &[
    ("DPS_ENDPOINT", "AGENT_DPS_ENDPOINT"),
    ("DPS_ID_SCOPE", "AGENT_DPS_ID_SCOPE"),
    ("DPS_REGISTRATION_ID", "AGENT_DPS_REGISTRATION_ID"),
    ("DPS_DEVICE_KEY", "AGENT_DPS_DEVICE_KEY"),
];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF, meaningless on the host
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    println!("cargo:rerun-if-changed=device_config.h");

    // Read provisioning defaults if they exist
    let config_path = "device_config.h";
    let contents = if Path::new(config_path).exists() {
        fs::read_to_string(config_path)?
    } else {
        println!("cargo:warning=device_config.h not found! Copy device_config.h.example to device_config.h and add your enrollment.");
        String::new()
    };

    for (define, env_name) in CONFIG_DEFINES {
        let needle = format!("#define {}", define);
        let value = contents
            .lines()
            .find(|l| l.trim_start().starts_with(&needle))
            .and_then(|l| l.split('"').nth(1))
            .unwrap_or("");
        println!("cargo:rustc-env={}={}", env_name, value);
    }

    Ok(())
}
