use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use sensorhub::agent::SensorHub;
use sensorhub::builder::SensorBuilder;
use sensorhub::bus::{self, SharedBus, StubI2cBus};
use sensorhub::config::{BusBackend, HubConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, Level};

const DEFAULT_BUS: &str = "/dev/i2c-1";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_arg = Arg::with_name("config")
        .short("c")
        .long("config")
        .value_name("FILE")
        .help("Path to the JSON configuration file")
        .takes_value(true)
        .required(true);
    let stub_arg = Arg::with_name("stub")
        .long("stub")
        .help("Use the in-memory stub bus instead of /dev/i2c-*");

    let matches = App::new("sensorhub")
        .version("0.1.0")
        .about("I2C sensor acquisition daemon publishing to MQTT")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Acquire and publish until interrupted")
                .arg(config_arg.clone())
                .arg(stub_arg.clone())
                .arg(
                    Arg::with_name("dry-run")
                        .long("dry-run")
                        .help("Log payloads instead of sending them to a broker"),
                ),
        )
        .subcommand(
            SubCommand::with_name("scan")
                .about("Probe a bus for responding devices")
                .arg(
                    Arg::with_name("bus")
                        .short("b")
                        .long("bus")
                        .value_name("PATH")
                        .help("Bus device node")
                        .takes_value(true)
                        .default_value(DEFAULT_BUS),
                )
                .arg(stub_arg.clone()),
        )
        .subcommand(
            SubCommand::with_name("check-config")
                .about("Load a configuration and build its sensors without publishing")
                .arg(config_arg)
                .arg(stub_arg),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match matches.subcommand() {
        ("run", Some(sub)) => run(sub),
        ("scan", Some(sub)) => scan(sub),
        ("check-config", Some(sub)) => check_config(sub),
        _ => Ok(()),
    }
}

fn backend(matches: &ArgMatches) -> BusBackend {
    if matches.is_present("stub") {
        BusBackend::Stub
    } else {
        BusBackend::Linux
    }
}

fn load_config(matches: &ArgMatches) -> Result<HubConfig, Box<dyn std::error::Error>> {
    let path = matches.value_of("config").unwrap_or_default();
    match HubConfig::load(path) {
        Ok(config) => Ok(config),
        Err(e) => {
            eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
            Err(e.into())
        }
    }
}

/// Sets `stop` on Ctrl-C from a helper thread with its own small runtime.
fn install_ctrl_c(stop: Arc<AtomicBool>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("interrupt received, shutting down"),
                    Err(e) => error!("failed to listen for Ctrl-C: {}", e),
                }
            });
            stop.store(true, Ordering::SeqCst);
        })?;
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(matches)?;
    let backend = backend(matches);
    let stop = Arc::new(AtomicBool::new(false));
    install_ctrl_c(Arc::clone(&stop))?;

    if matches.is_present("dry-run") {
        let mut hub = SensorHub::dry_run(&config, backend)?.with_stop_flag(stop);
        hub.run();
        print_summary(&serde_json::to_string_pretty(&hub.get_status())?);
    } else {
        let mut hub = SensorHub::from_config(&config, backend)?.with_stop_flag(stop);
        hub.run();
        print_summary(&serde_json::to_string_pretty(&hub.get_status())?);
    }
    Ok(())
}

fn print_summary(status: &str) {
    println!("{}", "Session summary".bright_white().bold());
    println!("{}", status);
}

fn open_bus(path: &str, backend: BusBackend) -> Result<SharedBus, Box<dyn std::error::Error>> {
    match backend {
        BusBackend::Stub => Ok(Arc::new(StubI2cBus::new(path)) as SharedBus),
        #[cfg(target_os = "linux")]
        BusBackend::Linux => Ok(Arc::new(bus::LinuxI2cBus::open(path)?) as SharedBus),
        #[cfg(not(target_os = "linux"))]
        BusBackend::Linux => Err(sensorhub::error::BusError::Unsupported.into()),
    }
}

fn known_device(addr: u8) -> &'static str {
    match addr {
        0x76 | 0x77 => "BME280",
        0x5C | 0x5D => "LPS25HB",
        _ => "unknown",
    }
}

fn scan(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let path = matches.value_of("bus").unwrap_or(DEFAULT_BUS);
    let bus = match open_bus(path, backend(matches)) {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("{} Failed to open {}: {}", "❌".red(), path.bright_white(), e);
            return Err(e);
        }
    };

    println!(
        "Scanning {} (0x{:02x}-0x{:02x})",
        bus.bus_path().bright_white(),
        bus::SCAN_FIRST_ADDRESS,
        bus::SCAN_LAST_ADDRESS
    );
    let found = bus::scan(bus.as_ref());
    if found.is_empty() {
        println!("{} No devices responded", "⚠️".yellow());
        return Ok(());
    }
    for addr in &found {
        let name = known_device(*addr);
        let name = if name == "unknown" { name.dimmed() } else { name.bright_cyan() };
        println!("  {} 0x{:02x}  {}", "✅".green(), addr, name);
    }
    println!("{} device(s) found", found.len().to_string().bright_green());
    Ok(())
}

fn check_config(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(matches)?;
    let backend = backend(matches);

    let (host, port) = config.mqtt.broker_endpoint()?;
    let platform = config.platform_name(backend);
    println!("{}", "Broker".bright_white().bold());
    println!("  endpoint   {}:{}", host, port);
    println!("  client id  {}", config.mqtt.client_id(&platform));
    println!("  topic base {}", config.mqtt.topic_base);
    println!("  qos        {}  retained {}", config.mqtt.qos, config.mqtt.retained);

    let mut builder = SensorBuilder::for_backend(backend, config.global_publish_interval());
    let sensors = builder.build_sensors(&config.sensors)?;

    println!("{}", "Sensors".bright_white().bold());
    println!("  {:<10} {:<24} {:>9}", "TYPE", "TOPIC", "INTERVAL");
    for sensor in &sensors {
        println!(
            "  {:<10} {:<24} {:>8}s",
            sensor.sensor_type().bright_cyan(),
            format!("{}/{}", config.mqtt.topic_base, sensor.topic_suffix()),
            sensor.publish_interval().as_secs()
        );
    }

    let stats = builder.get_stats();
    let built = format!("{} built", stats.built);
    println!(
        "  {}, {} disabled, {} skipped, {} bus(es)",
        if stats.built > 0 { built.green() } else { built.yellow() },
        stats.disabled,
        if stats.skipped > 0 { stats.skipped.to_string().red() } else { stats.skipped.to_string().normal() },
        builder.bus_count()
    );
    Ok(())
}
