use devrun::user_config::UserConfig;

use crate::args::ManifestArgs;

pub(crate) fn cmd_services(source: ManifestArgs) -> anyhow::Result<()> {
    let user = UserConfig::load()?;
    let plan = super::resolve_plan(&source, &user)?;

    println!(
        "{} ({})",
        plan.project.as_deref().unwrap_or("project"),
        plan.manifest_path.display()
    );

    for config in &plan.configs {
        let health = match &config.health_check.path {
            Some(path) => format!("{} {}", config.health_check.kind.as_str(), path),
            None => config.health_check.kind.as_str().to_string(),
        };
        println!();
        println!("  {}", config.name);
        println!("    command  {}", config.command_line());
        println!("    dir      {}", config.working_dir.display());
        if let Some(url) = config.url() {
            println!("    url      {}", url);
        }
        if let Some(language) = &config.language {
            match &config.framework {
                Some(framework) => println!("    runtime  {} ({})", language, framework),
                None => println!("    runtime  {}", language),
            }
        }
        println!("    health   {}", health);
    }

    for err in &plan.errors {
        println!();
        println!("  {}  error: {}", err.service(), err);
    }

    if !plan.errors.is_empty() && plan.configs.is_empty() {
        anyhow::bail!("no runnable services");
    }
    Ok(())
}
