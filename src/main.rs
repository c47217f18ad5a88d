use clap::{Arg, ArgAction, Command};

mod commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("cronrelay")
        .version(VERSION)
        .about("cronrelay - multi-tenant cron scheduling service for HTTP callouts")
        .subcommand(
            Command::new("serve")
                .about("Start the scheduler: workers, health probes, and TTL sweeps")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Path to a TOML configuration file"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Configuration utilities")
                .subcommand(
                    Command::new("validate")
                        .about("Load and validate the configuration, then exit")
                        .arg(
                            Arg::new("config")
                                .short('c')
                                .long("config")
                                .value_name("FILE")
                                .help("Path to a TOML configuration file"),
                        ),
                ),
        )
        .subcommand(
            Command::new("jobs").about("Job utilities").subcommand(
                Command::new("next-runs")
                    .about("Preview the next UTC fire times of a cron expression")
                    .arg(
                        Arg::new("expression")
                            .value_name("EXPR")
                            .required(true)
                            .help("5-field cron expression (min hour dom mon dow), UTC"),
                    )
                    .arg(
                        Arg::new("timezone")
                            .value_name("TZ")
                            .default_value("UTC")
                            .help("IANA zone used for the end-date bound"),
                    )
                    .arg(
                        Arg::new("count")
                            .short('n')
                            .long("count")
                            .value_name("N")
                            .default_value("5")
                            .help("Number of occurrences to print"),
                    )
                    .arg(
                        Arg::new("local")
                            .long("local")
                            .action(ArgAction::SetTrue)
                            .help("Also print each occurrence in the given zone"),
                    ),
            ),
        )
        .get_matches();

    let exit = match matches.subcommand() {
        Some(("serve", sub)) => commands::serve::run(sub).await,
        Some(("config", sub)) => match sub.subcommand() {
            Some(("validate", sub)) => commands::config::validate(sub),
            _ => {
                eprintln!("Unknown config subcommand. Use --help for usage.");
                1
            }
        },
        Some(("jobs", sub)) => match sub.subcommand() {
            Some(("next-runs", sub)) => commands::jobs::next_runs(sub),
            _ => {
                eprintln!("Unknown jobs subcommand. Use --help for usage.");
                1
            }
        },
        _ => {
            eprintln!("No command given. Use --help for usage.");
            1
        }
    };
    std::process::exit(exit);
}
