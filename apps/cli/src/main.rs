use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hexload_core::image::SegmentedImage;
use hexload_core::protocol::constants::LEDGER_VENDOR_ID;
use hexload_core::session::{LoaderSession, SessionConfig};
use hexload_core::transport::{ApduTransport, NusbTransport};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Secure bootloader loader (Pure Rust)", long_about = None)]
struct Cli {
    #[command(flatten)]
    session: SessionArgs,

    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// TOML session configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Trace frames without opening a device
    #[arg(long, global = true)]
    dry_run: bool,

    /// Wrap commands in the secure channel
    #[arg(long, global = true)]
    secure: bool,

    /// Secure channel key (32 hex characters)
    #[arg(long, global = true)]
    key: Option<String>,

    /// Target id to validate before loading
    #[arg(long, global = true, value_parser = parse_u32)]
    target_id: Option<u32>,

    /// Maximum APDU payload size
    #[arg(long, global = true)]
    max_frame: Option<usize>,

    /// Send absolute segment addresses instead of origin-relative ones
    #[arg(long, global = true)]
    absolute: bool,

    /// USB vendor id of the device (defaults to 0x2C97)
    #[arg(long, global = true, value_parser = parse_u16)]
    vid: Option<u16>,

    /// USB product id; without it the first device of the vendor is used
    #[arg(long, global = true, value_parser = parse_u16)]
    pid: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a binary image
    Load(ImageArgs),
    /// Load a binary image and boot it
    Run {
        #[command(flatten)]
        image: ImageArgs,

        /// Absolute entry point
        #[arg(long, value_parser = parse_u32)]
        boot: u32,

        /// Boot signature (hex)
        #[arg(long)]
        signature: Option<String>,
    },
    /// List installed applications
    List,
    /// Delete an installed application
    Delete {
        /// Application name
        name: String,
    },
    /// Install a custom certificate authority
    SetupCa {
        /// CA name
        #[arg(long)]
        name: String,

        /// CA public key (hex)
        #[arg(long)]
        public_key: String,
    },
    /// Remove the custom certificate authority
    ResetCa,
}

#[derive(Args, Debug)]
struct ImageArgs {
    /// Path to the binary image
    file: PathBuf,

    /// Load address of the first byte
    #[arg(long, value_parser = parse_u32)]
    base: u32,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let value = parse_u32(s)?;
    u16::try_from(value).map_err(|_| format!("'{s}' does not fit in 16 bits"))
}

fn open_device(args: &SessionArgs, config: &SessionConfig) -> Result<NusbTransport> {
    let transport = match (args.vid, args.pid) {
        (vid, Some(pid)) => {
            NusbTransport::open_with_ids(vid.unwrap_or(LEDGER_VENDOR_ID), pid, config.timeout())?
        }
        (None, None) => NusbTransport::open(config.timeout())?,
        (Some(_), None) => anyhow::bail!("--vid needs --pid"),
    };
    info!(
        vendor_id = %format!("{:04X}", transport.vendor_id()),
        product_id = %format!("{:04X}", transport.product_id()),
        "Device ready"
    );
    Ok(transport)
}

fn session_config(args: &SessionArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if args.secure {
        config.secure = true;
    }
    if let Some(key) = &args.key {
        config.key = Some(key.clone());
    }
    if args.target_id.is_some() {
        config.target_id = args.target_id;
    }
    if let Some(max_frame) = args.max_frame {
        config.max_frame = max_frame;
    }
    if args.absolute {
        config.relative = false;
    }
    Ok(config)
}

fn execute(cli: Cli) -> Result<()> {
    let config = session_config(&cli.session)?;

    let transport: Option<Box<dyn ApduTransport>> = if cli.session.dry_run {
        warn!("Dry run: no device will be opened");
        None
    } else {
        Some(Box::new(open_device(&cli.session, &config)?))
    };
    let mut session = LoaderSession::new(&config, transport)?;

    match cli.command {
        Commands::Load(image_args) => {
            let image = SegmentedImage::from_file(&image_args.file, image_args.base)?;
            load(&mut session, &config, &image)?;
        }
        Commands::Run {
            image: image_args,
            boot,
            signature,
        } => {
            let image = SegmentedImage::from_file(&image_args.file, image_args.base)?;
            let signature = signature
                .map(|s| hex::decode(s).context("signature is not valid hex"))
                .transpose()?;
            load(&mut session, &config, &image)?;
            session.run(&image, boot, signature.as_deref())?;
        }
        Commands::List => {
            let apps = session.list_all_apps()?;
            for app in &apps {
                println!(
                    "{:<32} flags=0x{:08X} hash={}",
                    app.name_lossy(),
                    app.flags,
                    app.hash_hex()
                );
            }
            info!(count = apps.len(), "Inventory listed");
        }
        Commands::Delete { name } => {
            session.delete_app(name.as_bytes())?;
            info!(name = %name, "Application deleted");
        }
        Commands::SetupCa { name, public_key } => {
            let public_key = hex::decode(public_key).context("public key is not valid hex")?;
            session.setup_custom_ca(name.as_bytes(), &public_key)?;
            info!(name = %name, "Custom CA installed");
        }
        Commands::ResetCa => {
            session.reset_custom_ca()?;
            info!("Custom CA removed");
        }
    }

    Ok(())
}

fn load(session: &mut LoaderSession, config: &SessionConfig, image: &SegmentedImage) -> Result<()> {
    if let Some(target_id) = config.target_id {
        session.validate_target_id(target_id)?;
    }
    let digest = session.load(image)?;
    println!("{digest}");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting hexload (nusb backend)...");

    if let Err(e) = execute(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("0xC0D00000"), Ok(0xC0D0_0000));
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert!(parse_u32("0xZZ").is_err());
        assert_eq!(parse_u16("0x2c97"), Ok(0x2C97));
        assert!(parse_u16("0x10000").is_err());
    }

    #[test]
    fn test_device_ids_parse() {
        let cli = Cli::parse_from(["hexload", "--vid", "0x2C97", "--pid", "0x0001", "list"]);
        assert_eq!(cli.session.vid, Some(0x2C97));
        assert_eq!(cli.session.pid, Some(0x0001));
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "hexload",
            "--secure",
            "--key",
            "000102030405060708090a0b0c0d0e0f",
            "--absolute",
            "--target-id",
            "0x31100004",
            "load",
            "app.bin",
            "--base",
            "0xC0D00000",
        ]);
        let config = session_config(&cli.session).unwrap();
        assert!(config.secure);
        assert!(!config.relative);
        assert_eq!(config.target_id, Some(0x3110_0004));
        assert!(matches!(
            cli.command,
            Commands::Load(ImageArgs {
                base: 0xC0D0_0000,
                ..
            })
        ));
    }
}
