use loam_core::config::TargetUri;

use crate::cli::ConfigCommands;
use crate::config_profiles::CliProfilesConfig;
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::SetTarget { uri, no_activate } => {
            run_set_target(global_profile, &uri, no_activate)
        }
        ConfigCommands::Show => run_show(global_profile),
    }
}

pub fn run_set_target(
    profile_name: Option<&str>,
    uri: &str,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load()?;
    let profile_name = set_target(&mut config, profile_name, uri, no_activate)?;
    let path = config.save()?;

    println!(
        "Profile '{}' syncs with {} ({})",
        profile_name,
        TargetUri::parse(uri)?,
        path.display()
    );
    Ok(())
}

/// Store the parsed target in the profile, returning the profile name
pub fn set_target(
    config: &mut CliProfilesConfig,
    profile_name: Option<&str>,
    uri: &str,
    no_activate: bool,
) -> Result<String, CliError> {
    let target = TargetUri::parse(uri)?;
    let profile_name = config.resolve_profile_name(profile_name);
    config.profile_mut_or_default(&profile_name).target = Some(target.to_string());
    if !no_activate {
        config.active_profile = Some(profile_name.clone());
    }
    Ok(profile_name)
}

fn run_show(global_profile: Option<&str>) -> Result<(), CliError> {
    let config = CliProfilesConfig::load()?;
    let profile_name = config.resolve_profile_name(global_profile);
    let target = config
        .profile(&profile_name)
        .and_then(crate::config_profiles::CliProfile::target);

    println!("Profile: {profile_name}");
    println!("Target:  {}", target.as_deref().unwrap_or("(not set)"));
    Ok(())
}
