use std::env;

use emrtd_access::lds::{DataGroup, DataGroupContent, ImageDataType};
use emrtd_access::{bytes2hex, AccessKeySeed, EmrtdError, PassportSession, PcscChannel, SessionConfig};
use tracing::{error, info, warn};

fn env_var(name: &str) -> String {
    match env::var(name) {
        Ok(value) => value,
        Err(_) => {
            error!("Please set {name} environment variable");
            std::process::exit(1);
        }
    }
}

fn main() -> Result<(), EmrtdError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    let doc_no = env_var("DOCNO");
    let birthdate = env_var("BIRTHDATE");
    let expirydate = env_var("EXPIRYDATE");
    let seed = AccessKeySeed::from_mrz(&doc_no, &birthdate, &expirydate)?;

    // Use the first reader.
    let channel = match PcscChannel::first_reader() {
        Ok(channel) => channel,
        Err(err) => {
            error!("Failed to open a reader: {err}");
            std::process::exit(1);
        }
    };

    let mut session = PassportSession::new(channel, SessionConfig::default());

    // Select eMRTD application
    session.select_application()?;
    info!(
        "ATR from attribute: {}",
        bytes2hex(&session.channel().atr()?)
    );

    session.perform_bac(seed)?;

    // Read EF.COM
    let ef_com = session.read_data_group(DataGroup::Com)?;
    let data_groups = match ef_com.com() {
        Some(com) => {
            info!(
                "LDS version {}, Unicode version {}",
                com.lds_version(),
                com.unicode_version()
            );
            com.data_groups()
        }
        None => Vec::new(),
    };

    for group in data_groups {
        let file = match session.read_data_group(group) {
            Ok(file) => file,
            Err(err) if err.card_error().is_some() => {
                warn!("Skipping {group}: {err}");
                continue;
            }
            Err(err) => return Err(err),
        };
        match file.content() {
            DataGroupContent::Dg1(mrz) => {
                info!("MRZ: {}", mrz.as_str());
                info!("Name: {}", mrz.name());
                info!("Document number: {}", mrz.document_number());
                info!("Date of birth: {}", mrz.date_of_birth());
                info!("Date of expiry: {}", mrz.date_of_expiry());
            }
            DataGroupContent::Dg2(faces) => {
                let face = faces.face_image()?;
                let path = match face.data_type {
                    ImageDataType::Jpeg2000 => "face.jp2",
                    _ => "face.jpg",
                };
                info!("Face image {}x{}, writing {path}", face.width, face.height);
                if let Err(err) = std::fs::write(path, face.data) {
                    error!("Error writing {path}: {err}");
                }
            }
            DataGroupContent::Dg11(details) => {
                info!("Full name: {:?}", details.full_name());
                info!("Place of birth: {:?}", details.place_of_birth());
            }
            DataGroupContent::Dg14(infos) => {
                for (key_id, key) in infos.public_keys() {
                    info!(
                        "Chip Authentication public key {key_id:?}: {:?}",
                        key.algorithm().map(|oid| oid.to_string())
                    );
                }
            }
            DataGroupContent::Dg15(key) => {
                info!(
                    "Active Authentication public key: {:?}",
                    key.algorithm().map(|oid| oid.to_string())
                );
            }
            _ => {
                let len = file.encoded().map(|bytes| bytes.len())?;
                info!("Read {group}, {len} bytes");
            }
        }
    }

    // Read EF.SOD
    let ef_sod = session.read_file(DataGroup::Sod)?;
    info!("Data from the EF.SOD: {}", bytes2hex(&ef_sod));

    session.close()?;
    Ok(())
}
