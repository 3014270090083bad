// End-to-end scenarios through the agent with recording fakes
