use std::{path::PathBuf, sync::LazyLock};

use clap::Parser;

pub mod account;
pub mod api;
pub mod bootstrap;
pub mod claude_web;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod router;
pub mod services;
pub mod sse;
pub mod state;
pub mod stream;
pub mod types;
pub mod utils;

pub const IS_DEBUG: bool = cfg!(debug_assertions);

pub static VERSION_INFO: LazyLock<String> = LazyLock::new(|| {
    format!(
        "v{} by {}\n| profile: {}",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_AUTHORS"),
        if IS_DEBUG { "debug" } else { "release" },
    )
});

pub const FIG: &str = r#"
        //
  ___  // ___          ___  __      __
//   )//|/   ) \   )/;___)/  )    /   )
//    // |  /   \ / //   /--<    /---/
((___///__|_/     |/ ((__/    \_/     /
"#;

/// Header for the application
pub static BANNER: LazyLock<String> = LazyLock::new(|| format!("{}\n{}", FIG, *VERSION_INFO));

/// Command line arguments for the application
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Load seed cookies from a file, one per line
    #[arg(short, long)]
    pub file: Option<PathBuf>,
    /// Alternative data folder
    #[arg(short, long)]
    pub data_folder: Option<PathBuf>,
}
