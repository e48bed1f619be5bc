use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use dyntable::transport::HttpTransport;
use dyntable::{
    AggregateFunction, AggregateSelection, App, AppConfig, AppEvent, Args, CacheManager,
    ConfigManager, FormData, RefreshOrchestrator, APP_NAME,
};
use ratatui::DefaultTerminal;
use std::path::Path;
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

fn render(terminal: &mut DefaultTerminal, app: &mut App) -> Result<()> {
    terminal.draw(|frame| frame.render_widget(app, frame.area()))?;
    Ok(())
}

fn run(
    mut terminal: DefaultTerminal,
    config: &AppConfig,
    orchestrator: RefreshOrchestrator,
    selection: AggregateSelection,
) -> Result<()> {
    let (tx, rx) = channel::<AppEvent>();
    let mut app = App::new(tx.clone(), orchestrator, selection, config);
    let poll_interval = Duration::from_millis(config.performance.event_poll_interval_ms);
    let size = terminal.size()?;
    tx.send(AppEvent::Resize(size.width, size.height))?;
    tx.send(AppEvent::Refresh)?;
    render(&mut terminal, &mut app)?;

    loop {
        if crossterm::event::poll(poll_interval)? {
            match crossterm::event::read()? {
                crossterm::event::Event::Key(key) => tx.send(AppEvent::Key(key))?,
                crossterm::event::Event::Resize(cols, rows) => {
                    tx.send(AppEvent::Resize(cols, rows))?
                }
                _ => {}
            }
        }

        let updated = match rx.recv_timeout(Duration::from_millis(0)) {
            Ok(event) => {
                match event {
                    AppEvent::Exit => break,
                    AppEvent::Crash(msg) => {
                        return Err(color_eyre::eyre::eyre!(msg));
                    }
                    event => {
                        if let Some(event) = app.event(&event) {
                            tx.send(event)?;
                        }
                    }
                }
                true
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => false,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };

        if updated {
            render(&mut terminal, &mut app)?;
        }
    }
    Ok(())
}

fn handle_early_exit_flags(args: &Args) -> Result<Option<()>> {
    if args.generate_config {
        let manager = ConfigManager::new(APP_NAME)?;
        let path = manager.write_default_config(args.force)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(Some(()));
    }

    if args.clear_cache {
        match CacheManager::new(APP_NAME) {
            Ok(cache) => {
                if let Err(e) = cache.clear_all() {
                    eprintln!("Error clearing cache: {}", e);
                    std::process::exit(1);
                }
                println!("Cache cleared successfully");
            }
            Err(_e) => println!("No cache to clear"),
        }
        return Ok(Some(()));
    }

    Ok(None)
}

/// Log to a file under the cache directory; the terminal belongs to the UI.
fn init_logging(cache: &CacheManager, debug: bool) -> Result<()> {
    let file = cache.open_log()?;
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| color_eyre::eyre::eyre!("Failed to initialize logging: {}", e))
}

fn load_form_data(path: &Path) -> Result<FormData> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read form data {}", path.display()))?;
    serde_json::from_str(&text)
        .wrap_err_with(|| format!("Failed to parse form data {}", path.display()))
}

/// Selections to start with: command-line columns replace the form defaults.
fn initial_selection(
    form: &FormData,
    args: &Args,
    aggregate: AggregateFunction,
) -> AggregateSelection {
    let mut selection = AggregateSelection::from_form_data(form, aggregate);
    if !args.group_by.is_empty() {
        selection.group_by_columns = args.group_by.clone();
    }
    if !args.metrics.is_empty() {
        selection.metric_columns = args.metrics.clone();
    }
    selection
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(()) = handle_early_exit_flags(&args)? {
        return Ok(());
    }

    color_eyre::install()?;

    let mut config = AppConfig::load(APP_NAME)?;
    config.apply_args(&args);
    config.validate()?;
    init_logging(&CacheManager::new(APP_NAME)?, config.debug.enabled)?;

    let Some(form_path) = args.form_data.as_deref() else {
        return Err(color_eyre::eyre::eyre!("No form data given"));
    };
    let form = load_form_data(form_path)?;
    let selection = initial_selection(&form, &args, config.default_aggregate()?);

    let transport = Arc::new(HttpTransport::new(
        &config.transport.protocol,
        &config.transport.host,
        config.timeout(),
    ));
    info!(host = %config.transport.host, datasource = %form.datasource, "starting");

    let orchestrator = RefreshOrchestrator::new(form, transport, config.refresh_settings());

    let terminal = ratatui::init();
    let result = run(terminal, &config, orchestrator, selection);
    ratatui::restore();
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
