use anyhow::Result;
use filing_harvest::config::Config;
use std::path::PathBuf;

pub fn init_config(path: PathBuf, force: bool) -> Result<()> {
    let config_path = path.join("config.toml");
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = Config::default();
    config.feed.url = Some("https://feeds.example.org/firms.xml.bz2".to_string());

    let toml_content = format!(
        "# filing-harvest configuration\n#\n# Set [feed] url (or local_path) before the first run.\n\n{}",
        config.to_toml()?
    );

    std::fs::create_dir_all(&path)?;
    std::fs::write(&config_path, toml_content)?;
    println!("Created configuration file: {}", config_path.display());

    Ok(())
}
