use std::io::{Error, ErrorKind, Result};

use nix::unistd::Pid;
use structopt::StructOpt;

use procscope::proc;
use procscope::session::Session;

#[derive(Debug, StructOpt)]
#[structopt(about)]
struct Arguments {
    /// Set debug level [0...5].
    #[structopt(long = "debug", value_name = "DEBUG_LEVEL", default_value = "0")]
    log_level: u32,

    /// Configures how to do logging (stdout|stderr|FILE).
    #[structopt(long = "log", value_name = "OUTPUT")]
    log_output: Option<String>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Print the target's memory map.
    Maps { pid: i32 },
    /// Print the target's auxiliary vector.
    Auxv { pid: i32 },
    /// List the target's loaded shared objects.
    Modules { pid: i32 },
    /// Resolve a symbol name to a target address.
    Symbol { pid: i32, name: String },
    /// Resolve a target address (hex) to a symbol.
    Addr { pid: i32, addr: String },
    /// Enumerate the target's live heap allocations.
    Heap { pid: i32 },
    /// Hex-dump target memory.
    DumpRaw { pid: i32, addr: String, len: usize },
}

fn parse_hex(s: &str) -> Result<u64> {
    let trimmed = s.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|e| {
        Error::new(ErrorKind::InvalidInput, format!("bad address {:?}: {}", s, e))
    })
}

fn run_app(args: &Arguments) -> Result<()> {
    match &args.command {
        Command::Maps { pid } => {
            for ent in proc::decode_proc_maps(Pid::from_raw(*pid))? {
                println!("{:?}", ent);
            }
        }
        Command::Auxv { pid } => {
            let auxv = proc::read_auxv(Pid::from_raw(*pid))?;
            let mut entries: Vec<(u64, u64)> = auxv.iter().collect();
            entries.sort();
            for (tag, value) in entries {
                println!("{:>12} ({:2}) = {:x}", proc::auxv_tag_name(tag), tag, value);
            }
        }
        Command::Modules { pid } => {
            let session = Session::new(Pid::from_raw(*pid))?;
            for module in session.modules()? {
                println!(
                    "{:16x} {}",
                    module.load_bias,
                    module.soname.as_ref().map(String::as_str).unwrap_or("<main>")
                );
            }
        }
        Command::Symbol { pid, name } => {
            let mut session = Session::new(Pid::from_raw(*pid))?;
            println!("{:x}", session.address_of(name)?);
        }
        Command::Addr { pid, addr } => {
            let query = parse_hex(addr)?;
            let mut session = Session::new(Pid::from_raw(*pid))?;
            let info = session.symbol_for(query)?;
            println!(
                "{} ({}) [{:x}-{:x}]",
                info.name, info.module, info.start, info.end
            );
        }
        Command::Heap { pid } => {
            let mut session = Session::new(Pid::from_raw(*pid))?;
            let total = session.heap_iterate(&mut |base, len| {
                println!("{:16x} {:8}", base, len);
            })?;
            println!("# {} allocations", total);
        }
        Command::DumpRaw { pid, addr, len } => {
            let query = parse_hex(addr)?;
            let session = Session::new(Pid::from_raw(*pid))?;
            let bytes = session.read_bytes(query, *len)?;
            for (k, chunk) in bytes.chunks(16).enumerate() {
                let hex: Vec<String> =
                    chunk.iter().map(|b| format!("{:02x}", b)).collect();
                println!("{:16x}  {}", query + 16 * k as u64, hex.join(" "));
            }
        }
    }
    Ok(())
}

#[paw::main]
fn main(args: Arguments) {
    setup_logger(args.log_level, args.log_output.as_ref().map(|s| s.as_ref()))
        .expect("set log level");

    if let Err(err) = run_app(&args) {
        eprintln!("procscope: {}", err);
        std::process::exit(1);
    }
}

fn fern_with_output(output: Option<&str>) -> Result<fern::Dispatch> {
    match output {
        None => Ok(fern::Dispatch::new().chain(std::io::stderr())),
        Some(s) => match s {
            "stdout" => Ok(fern::Dispatch::new().chain(std::io::stdout())),
            "stderr" => Ok(fern::Dispatch::new().chain(std::io::stderr())),
            output => {
                let f = std::fs::OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .create(true)
                    .open(output)?;
                Ok(fern::Dispatch::new().chain(f))
            }
        },
    }
}

fn setup_logger(level: u32, output: Option<&str>) -> Result<()> {
    let log_level = match level {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    fern_with_output(output)?
        .level(log_level)
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .apply()
        .map_err(|e| Error::new(ErrorKind::Other, e))
}
