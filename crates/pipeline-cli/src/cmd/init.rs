use anyhow::Context;
use pipeline_core::{config::Config, io, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing pipeline in: {}", root.display());

    let dir = paths::pipeline_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_path = paths::config_path(root);
    let config = if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
        Config::load(root).context("failed to load existing config")?
    } else {
        let config = Config::default();
        config.save(root).context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
        config
    };

    // Run state never belongs in version control.
    for entry in [&config.paths.lock_file, &config.paths.task_file] {
        if Path::new(entry).is_absolute() {
            continue;
        }
        io::ensure_gitignore_entry(root, entry)
            .with_context(|| format!("failed to add {entry} to .gitignore"))?;
    }

    println!("\nNext steps:");
    println!("  1. Edit {} (tracker repo, runner command, test command)", paths::CONFIG_FILE);
    println!("  2. pipeline config validate");
    println!("  3. Schedule `pipeline run` from cron");
    Ok(())
}
