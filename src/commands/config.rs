//! `cronrelay config validate`: startup validation without serving.

use clap::ArgMatches;

pub fn validate(matches: &ArgMatches) -> i32 {
    let config = match super::load_config(matches.get_one::<String>("config")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    match config.validate() {
        Ok(()) => {
            println!("configuration is valid");
            println!(
                "queue backend: {:?}, worker concurrency: {}, http timeout: {} ms",
                config.queue.backend, config.worker.concurrency, config.http.timeout_ms
            );
            0
        }
        Err(e) => {
            eprintln!("configuration is invalid: {e}");
            1
        }
    }
}
