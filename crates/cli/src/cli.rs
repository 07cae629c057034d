use clap::Parser;

/// Run a batch of demo tasks through the offload worker pool.
///
/// Spawns the pool, submits `--tasks` tasks of `--task-type`, waits for all
/// of them and prints the final pool stats as JSON.
#[derive(Parser, Debug)]
#[command(name = "offload", about = "Drive the offload worker pool with a demo batch")]
pub struct CliArgs {
    /// Path to a TOML pool config (defaults apply when not set)
    #[arg(long, env = "OFFLOAD_CONFIG")]
    pub config: Option<String>,

    /// Worker count override (still clamped to the configured bounds)
    #[arg(long)]
    pub size: Option<usize>,

    /// Number of tasks to submit
    #[arg(long, default_value = "100")]
    pub tasks: usize,

    /// Task type to submit: echo, spin, fail or ping
    #[arg(long, default_value = "spin")]
    pub task_type: String,

    /// Iterations per `spin` task
    #[arg(long, default_value = "200000")]
    pub spin_iterations: u64,

    /// Runtime flag broadcast to workers, as key=bool (repeatable)
    #[arg(long = "flag", value_parser = parse_flag)]
    pub flags: Vec<(String, bool)>,
}

fn parse_flag(raw: &str) -> Result<(String, bool), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=bool, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("flag name must not be empty".into());
    }
    let value = value
        .trim()
        .parse::<bool>()
        .map_err(|_| format!("flag '{key}' needs true or false, got '{value}'"))?;
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("emit_legacy=false").unwrap(), ("emit_legacy".into(), false));
        assert_eq!(parse_flag(" verbose = true ").unwrap(), ("verbose".into(), true));
        assert!(parse_flag("verbose").is_err());
        assert!(parse_flag("=true").is_err());
        assert!(parse_flag("verbose=yes").is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = CliArgs::parse_from(["offload"]);
        assert_eq!(args.tasks, 100);
        assert_eq!(args.task_type, "spin");
        assert!(args.flags.is_empty());
    }

    #[test]
    fn test_repeated_flags() {
        let args = CliArgs::parse_from(["offload", "--flag", "a=true", "--flag", "b=false", "--size", "3"]);
        assert_eq!(args.size, Some(3));
        assert_eq!(args.flags, vec![("a".into(), true), ("b".into(), false)]);
    }
}
