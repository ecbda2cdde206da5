use clap::{App, Arg, ErrorKind};
use tio_proxy::logging;
use tio_proxy::proxy::{Config, Proxy};

// sysexits.h EX_USAGE
const EX_USAGE: i32 = 64;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let matches = App::new("tio-proxy")
        .about("Multiplexes one or more sensors to many clients over TCP and WebSocket.")
        .arg(
            Arg::with_name("port")
                .short("p")
                .value_name("port")
                .takes_value(true)
                .help("TCP listen port. default 7855"),
        )
        .arg(
            Arg::with_name("ws_port")
                .short("w")
                .value_name("port")
                .takes_value(true)
                .help("WebSocket listen port. default 7853"),
        )
        .arg(
            Arg::with_name("forward")
                .short("f")
                .help("client forward mode"),
        )
        .arg(
            Arg::with_name("max_clients")
                .short("c")
                .value_name("max")
                .takes_value(true)
                .help("max simultaneous clients in shared mode, default 64"),
        )
        .arg(
            Arg::with_name("max_rpc")
                .short("r")
                .value_name("max")
                .takes_value(true)
                .help("max number of RPCs in flight in shared mode, default 64"),
        )
        .arg(Arg::with_name("hub").short("h").help("hub sensor mode"))
        .arg(
            Arg::with_name("hub_id")
                .short("i")
                .value_name("id")
                .takes_value(true)
                .help("id of the hub"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .help("verbose logging"),
        )
        .arg(
            Arg::with_name("ipv4")
                .short("4")
                .help("force IPv4 server only"),
        )
        .arg(
            Arg::with_name("timefmt")
                .short("t")
                .value_name("fmt")
                .takes_value(true)
                .help("timestamp format (default \"%F %T\", see man strftime)"),
        )
        .arg(
            Arg::with_name("microseconds")
                .short("u")
                .help("append microseconds to timestamp"),
        )
        .arg(
            Arg::with_name("reconnect_timeout")
                .short("T")
                .value_name("sec")
                .takes_value(true)
                .help("seconds to auto-reconnect a sensor before exiting (default 60)"),
        )
        .arg(
            Arg::with_name("sensor_url")
                .value_name("sensor_url")
                .multiple(true)
                .required(true)
                .help("sensor endpoint, e.g. tcp://host, serial://ttyUSB0:115200, file://capture"),
        )
        .get_matches_safe();

    let matches = match matches {
        Ok(matches) => matches,
        Err(err)
            if err.kind == ErrorKind::HelpDisplayed || err.kind == ErrorKind::VersionDisplayed =>
        {
            print!("{}", err.message);
            return 0;
        }
        Err(err) => {
            eprintln!("{}", err.message);
            return EX_USAGE;
        }
    };

    let mut cfg = Config::default();
    cfg.forward = matches.is_present("forward");
    cfg.hub = matches.is_present("hub");
    cfg.ipv4_only = matches.is_present("ipv4");
    cfg.sensor_urls = matches
        .values_of("sensor_url")
        .map(|urls| urls.map(str::to_string).collect())
        .unwrap_or_default();

    if let Some(port) = matches.value_of("port") {
        cfg.tcp_port = match port.parse() {
            Ok(port) => port,
            Err(_) => return usage("Invalid TCP port"),
        };
    }
    if let Some(port) = matches.value_of("ws_port") {
        cfg.ws_port = match port.parse() {
            Ok(port) => port,
            Err(_) => return usage("Invalid WebSocket port"),
        };
    }
    if let Some(max) = matches.value_of("max_clients") {
        cfg.max_clients = match max.parse() {
            Ok(0) | Err(_) => return usage("Must allow at least one client"),
            Ok(max) => max,
        };
    }
    if let Some(max) = matches.value_of("max_rpc") {
        cfg.max_rpcs = match max.parse::<u64>() {
            Ok(max) => max.min(0xFFFF) as u16,
            Err(_) => return usage("Invalid RPC limit"),
        };
    }
    if let Some(seconds) = matches.value_of("reconnect_timeout") {
        cfg.reconnect_timeout = match seconds.parse() {
            Ok(seconds) => seconds,
            Err(_) => return usage("Invalid reconnect timeout"),
        };
    }

    if cfg.forward {
        cfg.max_clients = 1;
    }
    if cfg.sensor_urls.is_empty() {
        return usage("No sensors specified");
    }
    if !cfg.hub && cfg.sensor_urls.len() != 1 {
        return usage("Only one sensor allowed in direct mode");
    }
    if cfg.sensor_urls.len() > 255 {
        return usage("Exceeded protocol limit of 255 sensors");
    }

    cfg.hub_id = match matches.value_of("hub_id") {
        Some(id) => id.to_string(),
        None => default_hub_id(),
    };

    let log = logging::init(
        matches.value_of("timefmt").unwrap_or(logging::DEFAULT_TIMESTAMP_FORMAT),
        matches.is_present("microseconds"),
        matches.is_present("verbose"),
    );

    let mut proxy = match Proxy::new(cfg, log) {
        Ok(proxy) => proxy,
        Err(err) => {
            eprintln!("{}", err);
            return 1;
        }
    };
    proxy.run()
}

fn usage(error: &str) -> i32 {
    eprintln!("{}", error);
    eprintln!(
        "Usage: tio-proxy [-p port] [-w port] [-f] [-c max_clients] [-r max_rpc] [-v] \
         [-h [-i hub_id]] [-4] [-t timefmt] [-u] [-T sec] sensor_url [sensor_url ...]"
    );
    EX_USAGE
}

/// Default hub id: `<hostname>.<pid>`.
fn default_hub_id() -> String {
    let mut buf = [0u8; 256];
    let host = unsafe {
        if libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..end]).into_owned()
        } else {
            "localhost".to_string()
        }
    };
    format!("{}.{}", host, std::process::id())
}
