//! `cronrelay jobs next-runs`: preview upcoming fire times.

use chrono::Utc;
use clap::ArgMatches;
use cronrelay_runtime::config::TimezoneSettings;
use cronrelay_runtime::TimePlanner;

pub fn next_runs(matches: &ArgMatches) -> i32 {
    let expression = matches
        .get_one::<String>("expression")
        .expect("required arg");
    let timezone = matches.get_one::<String>("timezone").expect("has default");
    let count: usize = match matches.get_one::<String>("count").expect("has default").parse() {
        Ok(count) => count,
        Err(_) => {
            eprintln!("--count must be a positive integer");
            return 1;
        }
    };
    let show_local = matches.get_flag("local");

    let planner = TimePlanner::new(TimezoneSettings::default());
    let tz = match planner.validate_timezone(timezone) {
        Ok(tz) => tz,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    match planner.next_n_fires(expression, count, Utc::now(), None, timezone) {
        Ok(fires) => {
            for fire in fires {
                if show_local {
                    println!("{}  ({})", fire.to_rfc3339(), fire.with_timezone(&tz));
                } else {
                    println!("{}", fire.to_rfc3339());
                }
            }
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}
