//! Writing the batch-queue submission script.
//!
//! Thin glue: the script is a PBS job sized from the queued row count,
//! invoking `app_run` against the same configuration file. It is meant to
//! be read and tweaked by operators, not parsed by machines.
use std::path::{Path, PathBuf};

use crate::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum JobScriptError {
    #[error("Could not write job script {} because: {reason}", .path.display())]
    CouldNotWrite { path: PathBuf, reason: String },
}

/// Render the PBS submission script. CPUs are capped at the number of
/// queued rows; there is no point asking the scheduler for idle cores.
pub fn render_job_script(config: &AppConfig, config_path: &Path, row_count: usize) -> String {
    let ncpus = config.cmor.ncpus.min(row_count.max(1));
    let mem_gb = u64::from(config.cmor.mem_per_cpu) * ncpus as u64;

    let mut storage = format!(
        "gdata/{p}+scratch/{p}",
        p = config.cmor.project
    );
    for proj in &config.cmor.addprojs {
        storage.push_str(&format!("+gdata/{proj}+scratch/{proj}"));
    }

    format!(
        "#!/bin/bash
#PBS -P {project}
#PBS -q {queue}
#PBS -l ncpus={ncpus}
#PBS -l mem={mem_gb}GB
#PBS -l wd
#PBS -l storage={storage}
#PBS -j oe
#PBS -o {app_logs}/app_run_pbs.log
#PBS -N app_{exp}

app_run --config {config_path}
",
        project = config.cmor.project,
        queue = config.cmor.queue,
        app_logs = config.app_logs_dir().display(),
        exp = config.cmor.exp,
        config_path = config_path.display(),
    )
}

pub fn write_job_script(
    config: &AppConfig,
    config_path: &Path,
    row_count: usize,
) -> Result<PathBuf, JobScriptError> {
    let path = config.app_job_path();
    let script = render_job_script(config, config_path, row_count);
    std::fs::write(&path, script).map_err(|e| JobScriptError::CouldNotWrite {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    log::info!("wrote job script to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::minimal_config;

    #[test]
    fn test_render_job_script_substitutions() {
        let mut config = minimal_config();
        config.cmor.ncpus = 4;
        config.cmor.mem_per_cpu = 16;
        config.cmor.addprojs = vec!["hh5".to_string()];

        let script = render_job_script(&config, Path::new("/etc/app/config.yaml"), 100);
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("#PBS -P p66"));
        assert!(script.contains("#PBS -q normal"));
        assert!(script.contains("#PBS -l ncpus=4"));
        assert!(script.contains("#PBS -l mem=64GB"));
        assert!(script.contains("#PBS -l storage=gdata/p66+scratch/p66+gdata/hh5+scratch/hh5"));
        assert!(script.contains("app_run --config /etc/app/config.yaml"));
    }

    #[test]
    fn test_cpus_capped_by_row_count() {
        let mut config = minimal_config();
        config.cmor.ncpus = 48;
        config.cmor.mem_per_cpu = 2;

        let script = render_job_script(&config, Path::new("c.yaml"), 3);
        assert!(script.contains("#PBS -l ncpus=3"));
        assert!(script.contains("#PBS -l mem=6GB"));

        // an empty queue still requests one CPU so the script stays valid
        let script = render_job_script(&config, Path::new("c.yaml"), 0);
        assert!(script.contains("#PBS -l ncpus=1"));
    }
}
