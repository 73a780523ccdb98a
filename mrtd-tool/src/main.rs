mod config;


use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, WrapErr};
use mrtd_access::iso7816::card::SmartCard;
use mrtd_access::mrz::BacKey;
use mrtd_access::pace::{parse_card_access, PaceParameters, PacePassword};
use mrtd_access::session::{ef_dg, Session, EF_CARD_ACCESS, EF_COM, EF_SOD, EMRTD_AID};
use mrtd_access::{Error, HexBytes};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ToolConfig;


#[derive(Clone, Debug, Parser)]
#[command(version, about)]
struct Opts {
    /// Configuration file; defaults to mrtd-tool.toml in the working directory, if present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Clone, Debug, Subcommand)]
enum Mode {
    /// Lists the PC/SC readers.
    ListReaders,

    /// Authenticates to a travel document and reads files from it.
    Read(ReadOpts),
}

#[derive(Args, Clone, Debug)]
struct ReadOpts {
    #[arg(short, long = "reader")]
    pub reader_index: Option<usize>,

    #[arg(short = 'n', long, required_unless_present = "can")]
    pub document_number: Option<String>,

    /// Date of birth (YYMMDD).
    #[arg(short, long, required_unless_present = "can")]
    pub birth_date: Option<String>,

    /// Date of expiry (YYMMDD).
    #[arg(short, long, required_unless_present = "can")]
    pub expiry_date: Option<String>,

    /// Use PACE instead of BAC.
    #[arg(long)]
    pub pace: bool,

    /// Perform PACE with the card access number instead of the MRZ.
    #[arg(long)]
    pub can: Option<String>,

    /// Files to read: hexadecimal file identifiers, "com", "sod" or "dg1" to "dg16".
    #[arg(short, long = "file", value_parser = parse_file_id)]
    pub files: Vec<u16>,
}


fn parse_file_id(name: &str) -> Result<u16, String> {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "com" => return Ok(EF_COM),
        "sod" => return Ok(EF_SOD),
        _ => {},
    }
    if let Some(number) = lower.strip_prefix("dg") {
        return match number.parse::<u8>() {
            Ok(n @ 1..=16) => Ok(ef_dg(n)),
            _ => Err(format!("no data group {:?}", number)),
        };
    }
    u16::from_str_radix(lower.trim_start_matches("0x"), 16)
        .map_err(|e| format!("invalid file identifier {:?}: {}", name, e))
}


/// Reads EF.CardAccess and picks the first PACE variant this library supports.
///
/// Returns `None` if the chip does not offer PACE.
fn find_pace_parameters<SC: SmartCard>(session: &Session<SC>) -> color_eyre::Result<Option<PaceParameters>> {
    let card_access = match session.read_file(EF_CARD_ACCESS) {
        Ok(contents) => contents,
        Err(Error::FileNotFound) => {
            info!("no EF.CardAccess");
            return Ok(None);
        },
        Err(e) => return Err(e).wrap_err("failed to read EF.CardAccess"),
    };
    println!("EF.CardAccess: {}", HexBytes(&card_access));

    let params = parse_card_access(&card_access)?
        .iter()
        .find_map(|info| match PaceParameters::from_pace_info(info) {
            Ok(params) => Some(params),
            Err(e) => {
                warn!(protocol = ?info.protocol, error = %e, "skipping PACE variant");
                None
            },
        });
    if params.is_none() {
        warn!("the chip offers no supported PACE variant");
    }
    Ok(params)
}


fn init_tracing(fallback_filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}


fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let opts = Opts::parse();
    let config = ToolConfig::load(opts.config.as_deref())
        .wrap_err("failed to load configuration")?;
    init_tracing(&config.log_level);

    let ctx = pcsc::Context::establish(pcsc::Scope::User)
        .wrap_err("failed to establish PC/SC user context")?;
    let readers_buf_len = ctx.list_readers_len()
        .wrap_err("failed to obtain length of buffer for PC/SC reader list")?;
    let mut readers_buf = vec![0u8; readers_buf_len];
    let readers: Vec<_> = ctx.list_readers(&mut readers_buf)
        .wrap_err("failed to list PC/SC readers")?
        .collect();

    let opts = match opts.mode {
        Mode::ListReaders => {
            for (i, reader) in readers.iter().enumerate() {
                println!("{}: {}", i, reader.to_string_lossy());
            }
            return Ok(());
        },
        Mode::Read(read_opts) => read_opts,
    };

    let reader_index = opts.reader_index.unwrap_or(config.reader_index);
    let reader = readers.get(reader_index)
        .ok_or_else(|| eyre!("no reader at index {}", reader_index))?;
    let card = ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)
        .wrap_err("failed to connect to card")?;
    info!(reader = %reader.to_string_lossy(), "connected");

    let session = Session::with_config(card, config.session);
    session.open()?;

    let bac_key = match (&opts.document_number, &opts.birth_date, &opts.expiry_date) {
        (Some(number), Some(birth), Some(expiry)) => Some(BacKey::new(number, birth, expiry)?),
        _ => None,
    };

    let use_pace = opts.pace || opts.can.is_some();
    let pace_done = if use_pace {
        let password = match (&opts.can, &bac_key) {
            (Some(can), _) => PacePassword::Can(can),
            (None, Some(key)) => PacePassword::Mrz(key),
            (None, None) => bail!("PACE requires either the MRZ fields or the card access number"),
        };
        match find_pace_parameters(&session)? {
            Some(params) => {
                info!(protocol = ?params.protocol(), "performing PACE");
                session.do_pace(&params, &password)
                    .wrap_err("PACE failed")?;
                true
            },
            None => false,
        }
    } else {
        false
    };

    session.select_applet(&EMRTD_AID)
        .wrap_err("failed to select the eMRTD application")?;
    if !pace_done {
        let Some(key) = &bac_key else {
            bail!("BAC requires the MRZ fields");
        };
        if use_pace {
            warn!("falling back to BAC");
        }
        session.do_bac(key)
            .wrap_err("BAC failed")?;
    }
    info!(state = ?session.state(), suite = ?session.secure_channel_suite(), "access control complete");

    let files = if opts.files.is_empty() { vec![EF_COM] } else { opts.files };
    for file_id in files {
        match session.read_file(file_id) {
            Ok(contents) => println!("{:04X}: {}", file_id, HexBytes(&contents)),
            Err(Error::FileNotFound) => println!("{:04X}: not present", file_id),
            Err(e) => return Err(e).wrap_err_with(|| format!("failed to read file {:04X}", file_id)),
        }
    }

    session.close();
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::parse_file_id;

    #[test]
    fn file_ids() {
        assert_eq!(parse_file_id("COM"), Ok(0x011E));
        assert_eq!(parse_file_id("sod"), Ok(0x011D));
        assert_eq!(parse_file_id("dg1"), Ok(0x0101));
        assert_eq!(parse_file_id("DG14"), Ok(0x010E));
        assert_eq!(parse_file_id("0x011C"), Ok(0x011C));
        assert_eq!(parse_file_id("011c"), Ok(0x011C));
        assert!(parse_file_id("dg17").is_err());
        assert!(parse_file_id("xyz").is_err());
    }
}
