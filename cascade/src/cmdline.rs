use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgGroup, Command};

pub(super) const DIR: &str = "dir";
pub(super) const LOG_NAME: &str = "log-name";
pub(super) const VERBOSE: &str = "verbose";
pub(super) const QUIET: &str = "quiet";
pub(super) const PARTITION: &str = "partition";
pub(super) const LIMIT: &str = "limit";
pub(super) const GROUP: &str = "group";
pub(super) const TO_END: &str = "to-end";
pub(super) const TO_OFFSET: &str = "to-offset";
pub(super) const TOPOLOGY: &str = "topology";
pub(super) const METRICS_PORT: &str = "metrics-port";

pub(super) fn root_cli() -> Command {
    Command::new("cascade")
        .about("Stream computations over partitioned logs")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(lag_subcmd())
        .subcommand(cat_subcmd())
        .subcommand(position_subcmd())
        .subcommand(run_subcmd())
}

fn dir_arg() -> Arg {
    Arg::new(DIR)
        .long(DIR)
        .help("Root directory of the file backed logs")
        .required(true)
        .action(ArgAction::Set)
        .value_parser(clap::value_parser!(PathBuf))
}

fn log_name_arg() -> Arg {
    Arg::new(LOG_NAME)
        .long(LOG_NAME)
        .help("Name of the stream")
        .action(ArgAction::Set)
        .value_parser(clap::value_parser!(String))
}

fn lag_subcmd() -> Command {
    Command::new("lag")
        .about("Lag of every consumer group, per stream")
        .arg(dir_arg())
        .arg(log_name_arg().help("Only report this stream, all streams otherwise"))
        .arg(
            Arg::new(VERBOSE)
                .long(VERBOSE)
                .short('v')
                .help("Add a row per partition")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(QUIET)
                .long(QUIET)
                .short('q')
                .help("Leave out groups without lag")
                .action(ArgAction::SetTrue),
        )
}

fn cat_subcmd() -> Command {
    Command::new("cat")
        .about("Print the records of a stream")
        .arg_required_else_help(true)
        .arg(dir_arg())
        .arg(log_name_arg().required(true))
        .arg(
            Arg::new(PARTITION)
                .long(PARTITION)
                .help("Only print this partition")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(LIMIT)
                .long(LIMIT)
                .help("Records to print per partition")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize)),
        )
}

fn position_subcmd() -> Command {
    Command::new("position")
        .about("Move a consumer group forward on every partition of a stream")
        .arg_required_else_help(true)
        .arg(dir_arg())
        .arg(log_name_arg().required(true))
        .arg(
            Arg::new(GROUP)
                .long(GROUP)
                .help("Consumer group, the computation name")
                .required(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new(TO_END)
                .long(TO_END)
                .help("Skip everything appended so far")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(TO_OFFSET)
                .long(TO_OFFSET)
                .help("Commit this offset, capped at the end of each partition")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u64)),
        )
        .group(
            ArgGroup::new("target")
                .args([TO_END, TO_OFFSET])
                .required(true),
        )
}

fn run_subcmd() -> Command {
    Command::new("run")
        .about("Run a topology until SIGINT or SIGTERM")
        .arg(dir_arg())
        .arg(
            Arg::new(TOPOLOGY)
                .long(TOPOLOGY)
                .help("Topology descriptor, read from CASCADE_TOPOLOGY_OBJECT when missing")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(METRICS_PORT)
                .long(METRICS_PORT)
                .help("Serve /metrics, /livez and /readyz on this port")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u16)),
        )
}
