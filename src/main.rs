use magma::{Config, Gateway};

use tracing_subscriber::EnvFilter;

const BANNER: &str = r#"

  /\/\   __ _  __ _ _ __ ___   __ _
 /    \ / _` |/ _` | '_ ` _ \ / _` |
/ /\/\ \ (_| | (_| | | | | | | (_| |
\/    \/\__,_|\__, |_| |_| |_|\__,_|
              |___/
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load("./application.yml")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .init();

    if config.spring.main.banner_mode != "off" {
        println!("{}", BANNER);
    }

    Gateway::run(config).await
}
