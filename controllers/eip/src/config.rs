//! Configuration surface: flags with matching `PEC_`-prefixed environment
//! variables. VPC id and region fall back to instance metadata when unset.

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Parser)]
#[command(name = "aws-pod-eip-controller", version, about = "Attaches Elastic IPs to annotated Pods")]
pub struct Flags {
    /// Controller log level
    #[arg(long, env = "PEC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "PEC_LOG_FORMAT", default_value = "text", value_parser = ["text", "json"])]
    pub log_format: String,

    /// Kubeconfig path, set only if the controller runs outside the cluster
    #[arg(long, env = "PEC_KUBECONFIG", default_value = "")]
    pub kubeconfig: String,

    /// Cluster name, marks EIP ownership in tags
    #[arg(long, env = "PEC_CLUSTER_NAME")]
    pub cluster_name: String,

    /// AWS VPC id, resolved from instance metadata when empty
    #[arg(long, env = "PEC_VPC_ID", default_value = "")]
    pub vpc_id: String,

    /// AWS region, resolved from instance metadata when empty
    #[arg(long, env = "PEC_REGION", default_value = "")]
    pub region: String,

    /// Namespace to watch, empty watches all namespaces
    #[arg(long, env = "PEC_WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: String,

    /// Resync period in seconds, 0 disables resync
    #[arg(long, env = "PEC_RESYNC_PERIOD", default_value_t = 0)]
    pub resync_period: u64,

    /// Queue worker count
    #[arg(long, env = "PEC_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Enable the orphaned-address recycler
    #[arg(long, env = "PEC_RECYCLE", default_value_t = false)]
    pub recycle: bool,

    /// Recycler period in seconds, 0 runs a single scan at start
    #[arg(long, env = "PEC_RECYCLE_PERIOD", default_value_t = 0)]
    pub recycle_period: u64,
}

impl Flags {
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::INFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Flags {
        let mut argv = vec!["aws-pod-eip-controller"];
        argv.extend_from_slice(args);
        Flags::try_parse_from(argv).unwrap()
    }

    #[test]
    fn cluster_name_is_required() {
        assert!(Flags::try_parse_from(["aws-pod-eip-controller"]).is_err());
    }

    #[test]
    fn defaults_apply() {
        let flags = parse(&["--cluster-name", "test"]);
        assert_eq!(flags.log_level, "info");
        assert_eq!(flags.log_format, "text");
        assert_eq!(flags.watch_namespace, "");
        assert_eq!(flags.resync_period, 0);
        assert_eq!(flags.workers, 1);
        assert!(!flags.recycle);
    }

    #[test]
    fn level_filter_parses_known_levels() {
        let flags = parse(&["--cluster-name", "test", "--log-level", "debug"]);
        assert_eq!(flags.level_filter(), LevelFilter::DEBUG);
    }

    #[test]
    fn level_filter_falls_back_to_info() {
        let flags = parse(&["--cluster-name", "test", "--log-level", "loud"]);
        assert_eq!(flags.level_filter(), LevelFilter::INFO);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let mut argv = vec!["aws-pod-eip-controller", "--cluster-name", "test"];
        argv.extend_from_slice(&["--log-format", "yaml"]);
        assert!(Flags::try_parse_from(argv).is_err());
    }
}
