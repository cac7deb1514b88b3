//! # Seed Data Generator
//!
//! Populates the database with a demo fleet and one deployment so a step
//! executor has something to claim during development.
//!
//! ## Usage
//! ```bash
//! # 25 devices (default)
//! cargo run -p fuota-db --bin seed
//!
//! # Custom fleet size
//! cargo run -p fuota-db --bin seed -- --devices 200
//!
//! # Specify database path
//! cargo run -p fuota-db --bin seed -- --db ./data/fuota.db
//! ```
//!
//! ## Generated Data
//! - One network server, service profile and application
//! - `N` devices with sequential EUIs `70b3d57ed0000001`, ...
//! - One multicast group containing every device
//! - One class-C deployment targeting every device, due now
//! - One unprovisioned multicast setup per device, due now

use chrono::{Duration, Utc};
use fuota_core::{
    Aes128Key, DevAddr, DevEui, DeploymentFilters, FuotaDeployment, GroupType, MulticastGroup,
    NetworkServer, RemoteMulticastSetup, RetrySchedule, ServiceProfile, SessionState,
};
use fuota_db::{Database, DbConfig};
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// LoRa Alliance demo OUI prefix.
const EUI_PREFIX: [u8; 4] = [0x70, 0xb3, 0xd5, 0x7e];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fuota_db=debug,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Parse command line arguments
    let args: Vec<String> = env::args().collect();

    let mut count: u32 = 25;
    let mut db_path = String::from("./fuota_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--devices" | "-n" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(25);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("FUOTA Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -n, --devices <N>  Number of devices to generate (default: 25)");
                println!("  -d, --db <PATH>    Database file path (default: ./fuota_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!(db = %db_path, devices = count, "Seeding FUOTA database");

    let db = Database::new(DbConfig::new(&db_path)).await?;

    let existing = db.deployments().count(&DeploymentFilters::default()).await?;
    if existing > 0 {
        warn!(
            existing,
            "Database already has deployments; skipping seed. Delete the file to regenerate."
        );
        return Ok(());
    }

    let start = std::time::Instant::now();
    let now = Utc::now();
    let lookups = db.lookups();

    let ns = lookups
        .create_network_server(&NetworkServer {
            id: 0,
            created_at: now,
            updated_at: now,
            name: "local".to_string(),
            server: "localhost:8000".to_string(),
            ca_cert: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
        })
        .await?;

    let service_profile_id = Uuid::new_v4().to_string();
    lookups
        .create_service_profile(&ServiceProfile {
            id: service_profile_id.clone(),
            name: "default".to_string(),
            network_server_id: ns.id,
        })
        .await?;
    let app = lookups
        .create_application("metering", &service_profile_id)
        .await?;

    let mut devices = Vec::with_capacity(count as usize);
    for n in 1..=count {
        let b = n.to_be_bytes();
        let eui = DevEui::from_bytes([
            EUI_PREFIX[0],
            EUI_PREFIX[1],
            EUI_PREFIX[2],
            EUI_PREFIX[3],
            b[0],
            b[1],
            b[2],
            b[3],
        ]);
        lookups
            .create_device(&eui, &format!("meter-{:04}", n), app.id)
            .await?;
        devices.push(eui);
    }
    info!(count = devices.len(), "Devices created");

    let group = db
        .multicast_groups()
        .create(&MulticastGroup {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name: "all-meters".to_string(),
            application_id: app.id,
            mc_app_s_key: Aes128Key::new([0x11; 16]),
            mc_key: Aes128Key::new([0x22; 16]),
            network_server: None,
        })
        .await?;
    for dev_eui in &devices {
        db.multicast_groups().add_device(&group.id, dev_eui).await?;
    }

    let mut deployment =
        FuotaDeployment::new("firmware-1.0.1", GroupType::C, vec![0xA5; 2048]);
    deployment.multicast_group_id = Some(group.id.clone());
    let deployment = db.deployments().create(&deployment, &devices).await?;
    info!(
        id = %deployment.id,
        fragments = deployment.fragment_count(),
        "Deployment created"
    );

    let setups = db.multicast_setups();
    for dev_eui in &devices {
        setups
            .create(&RemoteMulticastSetup {
                dev_eui: dev_eui.clone(),
                multicast_group_id: group.id.clone(),
                created_at: now,
                updated_at: now,
                mc_group_id: 0,
                mc_addr: DevAddr::from_bytes([0x01, 0x02, 0x03, 0x04]),
                mc_key_encrypted: Aes128Key::new([0x33; 16]),
                min_mc_f_cnt: 0,
                max_mc_f_cnt: i64::from(u32::MAX),
                state: SessionState::Setup,
                state_provisioned: false,
                retry: RetrySchedule::new(now, Duration::zero()),
            })
            .await?;
    }

    info!(elapsed = ?start.elapsed(), "Seed complete");
    Ok(())
}
