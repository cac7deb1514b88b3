//! Shared fixtures for repository tests.

use chrono::Utc;
use fuota_core::{Aes128Key, DevEui, MulticastGroup, NetworkServer, ServiceProfile};

use crate::pool::Database;

pub(crate) fn network_server(name: &str, server: &str) -> NetworkServer {
    let now = Utc::now();
    NetworkServer {
        id: 0,
        created_at: now,
        updated_at: now,
        name: name.to_string(),
        server: server.to_string(),
        ca_cert: String::new(),
        tls_cert: String::new(),
        tls_key: String::new(),
    }
}

/// One network server, service profile and application with `n` devices.
pub(crate) struct Fixture {
    pub application_id: i64,
    pub devices: Vec<DevEui>,
}

impl Fixture {
    pub(crate) async fn new(db: &Database, n: u8) -> Self {
        let lookups = db.lookups();
        let ns = lookups
            .create_network_server(&network_server("ns", "localhost:8000"))
            .await
            .unwrap();
        lookups
            .create_service_profile(&ServiceProfile {
                id: "sp".to_string(),
                name: "sp".to_string(),
                network_server_id: ns.id,
            })
            .await
            .unwrap();
        let app = lookups.create_application("app", "sp").await.unwrap();

        let mut devices = Vec::new();
        for i in 0..n {
            let eui = DevEui::from_bytes([0, 0, 0, 0, 0, 0, 0, i + 1]);
            lookups
                .create_device(&eui, &format!("device-{}", i + 1), app.id)
                .await
                .unwrap();
            devices.push(eui);
        }

        Fixture {
            application_id: app.id,
            devices,
        }
    }

    /// Creates a multicast group owned by the fixture's application.
    pub(crate) async fn group(&self, db: &Database, name: &str) -> MulticastGroup {
        let now = Utc::now();
        db.multicast_groups()
            .create(&MulticastGroup {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: now,
                updated_at: now,
                name: name.to_string(),
                application_id: self.application_id,
                mc_app_s_key: Aes128Key::new([1; 16]),
                mc_key: Aes128Key::new([2; 16]),
                network_server: None,
            })
            .await
            .unwrap()
    }
}
