use color_eyre::eyre::{eyre, Result};
use directories::ProjectDirs;
use obd_gauge::app::App;
use obd_gauge::config::LoggingConfig;
use obd_gauge::Config;
use ratatui::crossterm::event::{self, DisableMouseCapture, EnableMouseCapture};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "OBD_GAUGE_LOG";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "obd-gauge", "obd-gauge")
}

fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = project_dirs() {
        let path = proj_dirs.config_dir().join("config.toml");
        if path.exists() {
            return path;
        }
    }
    PathBuf::from("config/default.toml")
}

fn log_path(logging: &LoggingConfig) -> PathBuf {
    if let Some(file) = &logging.file {
        return file.clone();
    }
    match project_dirs() {
        Some(proj_dirs) => proj_dirs.data_dir().join("obd-gauge.log"),
        None => PathBuf::from("obd-gauge.log"),
    }
}

/// Logs go to a file; the terminal belongs to the dial.
fn init_logging(logging: &LoggingConfig) -> Result<PathBuf> {
    let path = log_path(logging);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| eyre!("failed to install logger: {e}"))?;
    Ok(path)
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let _ = dotenvy::dotenv();

    let config_path = get_config_path();
    let (config, load_error) = match Config::load(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    let log_file = init_logging(&config.logging)?;
    tracing::info!("Logging to {}", log_file.display());
    match load_error {
        None => tracing::info!("Loaded config from {}", config_path.display()),
        Some(e) => tracing::warn!(
            "Using default config, {} could not be loaded: {}",
            config_path.display(),
            e
        ),
    }

    let mut app = App::new(config)?;
    app.init();

    let mut terminal = ratatui::init();
    let _ = ratatui::crossterm::execute!(io::stdout(), EnableMouseCapture);

    let result = run(&mut terminal, &mut app);

    let _ = ratatui::crossterm::execute!(io::stdout(), DisableMouseCapture);
    ratatui::restore();
    app.shutdown();

    if let Err(e) = &result {
        tracing::error!("Exited with error: {e}");
    }
    result
}

fn run(terminal: &mut ratatui::DefaultTerminal, app: &mut App) -> Result<()> {
    loop {
        terminal.draw(|frame| app.render(frame))?;

        if event::poll(Duration::from_millis(50))? {
            if app.handle_event(event::read()?) {
                app.should_quit = true;
            }
        }

        app.process_setup_events();

        if app.should_quit {
            break;
        }
    }

    tracing::info!("Setup finished: {}", app.coordinator.get_state().setup_complete);
    Ok(())
}
