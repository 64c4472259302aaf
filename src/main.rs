use clap::Parser;

use clover::{Args, error::CloverError};

fn main() -> Result<(), CloverError> {
    let args = Args::parse();
    // the config singleton reads these before first load
    if let Some(data_folder) = args.data_folder {
        unsafe { std::env::set_var("CLOVER_DATA_FOLDER", &data_folder) };
    }
    if let Some(file) = args.file {
        if let Ok(cookies) = std::fs::read_to_string(&file) {
            let entries = cookies
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| format!("{line:?}"))
                .collect::<Vec<_>>()
                .join(",");
            unsafe { std::env::set_var("CLOVER_COOKIES", format!("[{entries}]")) };
        } else {
            eprintln!("Cookie file not found: {}", file.display());
        }
    }
    #[cfg(windows)]
    let _ = enable_ansi_support::enable_ansi_support();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(clover::bootstrap::run())
}
