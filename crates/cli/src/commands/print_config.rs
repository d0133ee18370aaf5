use pixelcast::StreamConfig;

pub fn execute(config: &StreamConfig) -> anyhow::Result<i32> {
	println!("{}", render(config)?);
	Ok(0)
}

fn render(config: &StreamConfig) -> serde_json::Result<String> {
	serde_json::to_string_pretty(&config.redacted())
}
