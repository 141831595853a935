pub mod pipeline;

pub use pipeline::*;

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::{debug, info};

const ENV_PREFIX: &str = "PRICECAST";
const ENV_SEPARATOR: &str = "__";

/// Load the optional TOML file, then overlay `PRICECAST__SECTION__KEY` variables.
///
/// A missing file is only an error when `required` is set.
pub fn load_config(path: &Path, required: bool) -> Result<PipelineConfig> {
    load_with_env(path, required, None)
}

fn load_with_env(
    path: &Path,
    required: bool,
    env: Option<::config::Map<String, String>>,
) -> Result<PipelineConfig> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::from(path).required(required))
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        )
        .build()
        .with_context(|| format!("reading configuration from {}", path.display()))?;

    let mut config: PipelineConfig = settings.try_deserialize()?;
    fill_telegram_from_env(&mut config.notifications);

    config
        .validate()
        .map_err(|errors| anyhow!("invalid configuration: {}", errors.join(", ")))?;

    debug!("Loaded configuration: {:?}", config.store);
    Ok(config)
}

/// Bot credentials usually live in `.env`, not in the TOML file
fn fill_telegram_from_env(settings: &mut NotificationSettings) {
    if settings.bot_token.is_none() {
        settings.bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
    }
    if settings.chat_id.is_none() {
        settings.chat_id = std::env::var("TELEGRAM_CHAT_ID").ok();
    }
}

/// Write the default configuration as TOML
pub fn write_default_config(path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(&PipelineConfig::default())?;
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    info!("Default configuration written to {}", path.display());
    Ok(())
}
