use farm_core::{Config, Paths};

pub fn init(paths: &Paths, force: bool) -> anyhow::Result<()> {
    let path = paths.config_file();
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }
    paths.ensure_dirs()?;
    let mut config = Config::default();
    let (agent_id, _) = config.ensure_agent_id();
    config.save(&path)?;
    println!("Wrote {}", path.display());
    println!("Agent id: {}", agent_id);
    Ok(())
}

pub fn show(paths: &Paths) -> anyhow::Result<()> {
    let config = Config::load_or_default(paths)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
