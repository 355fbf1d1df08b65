//! Tracing subscriber setup.

use jobmesh_config::NodeConfig;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; otherwise `info` plus any per-service overrides.
fn filter(directives: &[String]) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new("info");
        for directive in directives {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
            }
        }
        filter
    })
}

pub fn init(config: &NodeConfig, directives: &[String]) {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(directives));
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}
