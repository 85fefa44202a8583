//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use santa_core::{DrawStrategy, User};
use uuid::Uuid;

use crate::store::StorageConfig;

/// Secret Santa event coordination service
#[derive(Parser, Debug, Clone)]
#[command(name = "santa-backend")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Where users and events are kept
    #[arg(long, env = "STORAGE", value_enum, default_value = "json")]
    pub storage: StorageKind,

    /// Directory holding users.json and events.json (json storage only)
    #[arg(long, env = "DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// Public base URL invitation links point at
    #[arg(long, env = "APP_URL", default_value = "http://localhost:3000")]
    pub app_url: String,

    /// How receivers are drawn: single-swap or rejection
    #[arg(long, env = "DRAW_STRATEGY", default_value = "single-swap")]
    pub draw_strategy: DrawStrategy,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Admin seeded when the store holds no users
    #[arg(long, env = "ADMIN_EMAIL", default_value = "admin@example.com")]
    pub admin_email: String,

    #[arg(long, env = "ADMIN_NAME", default_value = "Admin")]
    pub admin_name: String,

    /// Password for the seeded admin; a random one is generated when unset
    #[arg(long, env = "ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Replace all users with the records in a JSON file keyed by user id
    ImportUsers { file: PathBuf },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Json,
}

impl Args {
    pub fn storage_config(&self) -> StorageConfig {
        match self.storage {
            StorageKind::Memory => StorageConfig::Memory,
            StorageKind::Json => StorageConfig::JsonFiles {
                dir: self.data_dir.clone(),
            },
        }
    }

    /// The user written by `service::bootstrap_users`, and whether its
    /// password was generated here.
    pub fn bootstrap_admin(&self) -> (User, bool) {
        let (password, generated) = match &self.admin_password {
            Some(password) if !password.is_empty() => (password.clone(), false),
            _ => (Uuid::new_v4().simple().to_string(), true),
        };
        let admin = User {
            id: "admin".to_string(),
            name: self.admin_name.clone(),
            email: self.admin_email.clone(),
            password,
            is_admin: true,
            password_changed: false,
        };
        (admin, generated)
    }

    pub fn settings(&self) -> Settings {
        Settings {
            app_url: self.app_url.clone(),
            draw_strategy: self.draw_strategy,
        }
    }
}

/// Runtime knobs the HTTP handlers need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub app_url: String,
    pub draw_strategy: DrawStrategy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_url: "http://localhost:3000".to_string(),
            draw_strategy: DrawStrategy::default(),
        }
    }
}
