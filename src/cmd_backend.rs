use procfamily::family::{select_backend, PlatformCaps};
use procfamily::TrackerConfig;

pub(crate) fn cmd_backend(json: bool) -> anyhow::Result<()> {
    let config = TrackerConfig::load()?;
    let caps = PlatformCaps::detect(&config);
    let backend = select_backend(&config, &caps);

    if json {
        let report = serde_json::json!({
            "backend": backend,
            "preference": config.backend,
            "cgroup_v1_mounted": caps.cgroup_v1_mounted,
            "cgroup_base_writable": caps.cgroup_base_writable,
            "procd_enabled": config.procd.enabled,
            "procd_address": config.procd.address,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("backend              {backend}");
    println!("preference           {:?}", config.backend);
    println!("cgroup v1 mounted    {}", caps.cgroup_v1_mounted);
    println!("cgroup base writable {}", caps.cgroup_base_writable);
    println!("procd enabled        {}", config.procd.enabled);
    println!("procd address        {}", config.procd.address.display());
    Ok(())
}
