use std::env;

use vessel_rtc::config::Config;
use vessel_rtc::runtime;
use vessel_rtc::util::init_log;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "vessel" => {
                init_log();
                let config = Config::from_env()?;
                runtime::main(config)
            }
            _ => {
                print_usage();
                Ok(())
            }
        }
    } else {
        print_usage();
        Ok(())
    }
}

fn print_usage() {
    println!("Vessel RTC");
    println!("Usage:");
    println!("  cargo run vessel  - Contact the monitoring centre and share conning");
    println!();
    println!("Environment:");
    println!("  VRGP_MMSI                vessel identity (required)");
    println!("  VRGP_MOC                 monitoring centre host or URL (required)");
    println!("  VRGP_GUIDANCE            guidance level [recommendation]");
    println!("  VRGP_SECURE              use wss for composed addresses [true]");
    println!("  VRGP_STATUS_INTERVAL_MS  status report period [5000]");
    println!("  VRGP_NMEA_FILE           sentences to share, one per line");
    println!("  VRGP_ICE_SERVERS         JSON array of ice servers");
}
