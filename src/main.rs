//! Command-line front end: argument validation, the image file, and the
//! serial device; everything else happens in the library.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use bridgeflash::{Bridge, Flash, SerialTransport, ADDRESS_MASK};

const BAUD: u32 = 115_200;

/// Parse a number: 0x prefix for hex, a leading 0 for octal, decimal
/// otherwise.
fn parse_num(s: &str) -> Result<u64, String> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    u64::from_str_radix(digits, radix).map_err(|e| format!("invalid number: {}", e))
}

#[derive(Parser)]
#[command(name = "bridgeflash", version, about = "Program, read, and erase SPI NOR flash through a serial bridge")]
struct Args {
    /// Serial port device
    #[arg(short = 'p', value_name = "port")]
    port: String,

    /// File to dump into or program from
    #[arg(short = 'f', value_name = "file")]
    file: Option<PathBuf>,

    /// Dump ROM content into the file
    #[arg(short = 'r')]
    read: bool,

    /// Program ROM content from the file
    #[arg(short = 'w')]
    write: bool,

    /// Offset into the file to start from
    #[arg(short = 'b', value_name = "file_offset", value_parser = parse_num, default_value = "0")]
    file_offset: u64,

    /// Offset into the ROM to start from
    #[arg(short = 'B', value_name = "rom_offset", value_parser = parse_num, default_value = "0")]
    rom_offset: u64,

    /// Number of bytes to read or write
    #[arg(short = 's', value_name = "size", value_parser = parse_num)]
    size: Option<u64>,

    /// Perform a chip erase; incompatible with the range options
    #[arg(short = 'e')]
    erase: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    if args.read as u8 + args.write as u8 + args.erase as u8 > 1 {
        bail!("only one of -r, -w, -e can be specified");
    }
    if args.erase && (args.file_offset != 0 || args.rom_offset != 0 || args.size.is_some()) {
        bail!("-e cannot be combined with the range options");
    }
    if args.rom_offset > ADDRESS_MASK as u64 {
        bail!("ROM offset out of range");
    }
    if let Some(size) = args.size {
        if size > ADDRESS_MASK as u64 || args.rom_offset + size > ADDRESS_MASK as u64 {
            bail!("size out of range");
        }
    }

    let transport = SerialTransport::open(&args.port, BAUD).context("failed to open serial port")?;
    let mut bridge = Bridge::new(transport);
    let mut flash = Flash::new(&mut bridge);

    // An unreadable identity is reported but not fatal: the part may
    // still accept the data-path commands.
    match flash.read_id() {
        Ok(id) => println!("Chip ID: {}", id),
        Err(err) => log::warn!("Cannot get chip ID, trying to continue: {}", err),
    }

    if args.erase {
        println!("Performing chip erase...");
        flash.erase_progress().context("chip erase failed")?;
        println!("Chip erased!");
        return Ok(());
    }

    if args.read {
        let size = match args.size {
            Some(0) | None => bail!("please specify a size for reading"),
            Some(size) => size,
        };
        if args.file_offset != 0 {
            bail!("a file offset is not allowed for option -r");
        }
        let path = match args.file.as_deref() {
            Some(path) => path,
            None => bail!("no file specified"),
        };
        println!("Reading ROM content");
        let data = flash
            .read_progress(args.rom_offset as u32, size as usize)
            .context("read failed")?;
        fs::write(path, &data).context("failed to write output file")?;
        println!("Operation complete.");
    }

    if args.write {
        let path = match args.file.as_deref() {
            Some(path) => path,
            None => bail!("no file specified"),
        };
        let mut file = File::open(path).context("failed to open input file")?;
        let file_len = file.metadata().context("failed to stat input file")?.len();
        if args.file_offset > file_len {
            bail!("file offset is past the end of the file");
        }
        let size = match args.size {
            Some(size) => size,
            None => file_len - args.file_offset,
        };
        if size == 0 {
            bail!("nothing to write");
        }
        if size > ADDRESS_MASK as u64 || args.rom_offset + size > ADDRESS_MASK as u64 {
            bail!("size out of range");
        }
        file.seek(SeekFrom::Start(args.file_offset))
            .context("failed to seek input file")?;
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data).context("failed to read input file")?;
        println!("Performing programming...");
        flash
            .program_progress(args.rom_offset as u32, &data)
            .context("programming failed")?;
        println!("Operation complete.");
    }

    Ok(())
}
