//! Workspace setup: `init`, `project` and `config`.

use std::path::Path;

use anyhow::{Context, Result};

use conveyor::config::{CONFIG_DIR, CONFIG_FILE, ConveyorConfig, ConveyorToml};
use conveyor::store::StoreDb;

use super::super::{ConfigCommands, ProjectCommands};
use super::Workspace;

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    let config_path = config_dir.join(CONFIG_FILE);
    let wrote_config = if config_path.exists() && !force {
        false
    } else {
        ConveyorToml::default().save(&config_path)?;
        true
    };

    let config = ConveyorConfig::new(project_dir.to_path_buf())?;
    let db_path = config.db_path();
    StoreDb::new(&db_path)?;

    if wrote_config {
        println!("Initialized conveyor at {}", config.config_dir.display());
    } else {
        println!(
            "Conveyor already initialized at {}",
            config.config_dir.display()
        );
    }
    println!("  config:   {}", config_path.display());
    println!("  database: {}", db_path.display());
    Ok(())
}

pub fn cmd_project(project_dir: &Path, command: ProjectCommands) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let db = ws.db.lock_sync()?;
    match command {
        ProjectCommands::Add {
            name,
            git_url,
            base_branch,
        } => {
            if db.find_project_by_name(&name)?.is_some() {
                anyhow::bail!("Project '{}' already exists", name);
            }
            let project = db.create_project(&name, git_url.as_deref(), &base_branch, chrono::Utc::now())?;
            println!("Created project {} ({})", project.id, project.name);
        }
        ProjectCommands::List => {
            let projects = db.list_projects()?;
            if projects.is_empty() {
                println!("No projects.");
            }
            for p in projects {
                println!(
                    "{:>4}  {:<24} {:<12} {}",
                    p.id,
                    p.name,
                    p.base_branch,
                    p.git_url.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = ConveyorConfig::new(project_dir.to_path_buf())?;
            if config_path.exists() {
                println!("# {}", config_path.display());
            } else {
                println!("# no {} found, showing defaults", CONFIG_FILE);
            }
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            print!("{rendered}");
        }
        Some(ConfigCommands::Validate) => {
            let mut toml = ConveyorToml::load_or_default(&project_dir.join(CONFIG_DIR))?;
            toml.apply_env();
            let problems = toml.validate();
            if problems.is_empty() {
                println!("{}", console::style("Configuration is valid.").green());
            } else {
                for problem in &problems {
                    println!("  {} {}", console::style("✗").red(), problem);
                }
                anyhow::bail!("{} configuration problem(s)", problems.len());
            }
        }
    }
    Ok(())
}
