use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub fn default_directives(verbose: u8) -> &'static str {
	match verbose {
		0 => "warn,pixelcast=info",
		1 => "info,pixelcast=debug",
		2 => "debug,pixelcast=trace",
		_ => "trace",
	}
}

/// Logs to stderr. `RUST_LOG` wins over `-v`.
pub fn init_logging(verbose: u8) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(verbose > 0)
		.with_writer(std::io::stderr)
		.init();
}
