use std::{fs, process};

//
// cargo run -- list
// cargo run -- print drawing.png caption.txt
// USE_PRINTER_DUMMY=true cargo run -- text notes.txt
//
use escpos_thermal::{sanitize_for_receipt, Config, DeviceProbe, HostProbe, PrintJob, Printer};

fn print_usage() {
    println!("Usage: escpos-thermal <COMMAND>");
    println!("Commands:");
    println!("  list                     List attached USB and serial devices");
    println!("  print <image> [text]     Print an image, optionally followed by a text file");
    println!("  text <text>              Print a text file");
    println!("\nSettings are read from the environment and from .env, see USE_PRINTER_DUMMY.");
}

fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{}:{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                record.args()
            )
        })
        .init();

    let args: Vec<String> = std::env::args().collect();

    let result = match args.get(1).map(String::as_str) {
        Some("list") => list_devices(),
        Some("print") if args.len() >= 3 => print_files(Some(&args[2]), args.get(3)),
        Some("text") if args.len() >= 3 => print_files(None, Some(&args[2])),
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

fn list_devices() -> Result<(), Box<dyn std::error::Error>> {
    let devices = HostProbe.attached()?;
    if devices.is_empty() {
        println!("no devices attached");
    }
    for device in devices {
        match device.port {
            Some(port) => println!("{} {} {}", device.id, device.kind, port),
            None => println!("{} {}", device.id, device.kind),
        }
    }
    Ok(())
}

fn print_files(image: Option<&String>, text: Option<&String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let printer = Printer::new(config)?;

    let mut job = PrintJob::new();
    if let Some(path) = image {
        job = job.encoded_image(fs::read(path)?);
    }
    if let Some(path) = text {
        job = job.text(sanitize_for_receipt(&fs::read_to_string(path)?));
    }

    printer.print(&job)?;

    if printer.config().is_dummy() {
        println!(
            "Printed to dummy printer. ESC/POS bytes saved to {}",
            printer.config().link().capture_path.display()
        );
    } else {
        println!("Printed successfully.");
    }
    Ok(())
}
