use super::*;

pub struct App {
    pub should_quit: bool,
    pub config: Config,
    pub manager: Arc<AsyncOperationManager>,
    pub coordinator: Arc<SetupStateCoordinator>,
    pub bluetooth: BluetoothSetupInterface,
    pub capability_factory: CapabilityFactory,
    pub layout: CircularLayout,
    pub keybinds: Keybinds,
    pub show_help: bool,
    pub show_all_devices: bool,
    pub last_error: Option<String>,
    pub event_tx: mpsc::Sender<SetupEvent>,
    pub event_rx: mpsc::Receiver<SetupEvent>,
    pub last_cleanup: Instant,
    /// Finished operation records older than this are dropped.
    pub finished_operation_max_age: Duration,
}

impl App {
    /// Builds the wizard and starts the worker pool. Bluetooth is brought
    /// up separately by [`App::init`].
    pub fn new(config: Config) -> Result<Self, WorkerError> {
        let manager = Arc::new(AsyncOperationManager::new(config.workers.clone()));
        manager.start()?;

        let coordinator = Arc::new(SetupStateCoordinator::new(
            config.bluetooth.discovery_timeout(),
            ControlVisibility::new(config.display.fade_delay(), config.display.fade_duration()),
        ));
        let bluetooth = BluetoothSetupInterface::new(
            manager.clone(),
            coordinator.clone(),
            config.bluetooth.init_timeout(),
        );
        let ctl_config = config.bluetooth.ctl_config();
        let capability_factory: CapabilityFactory = Arc::new(move || {
            let ctl = BluetoothCtl::new(ctl_config.clone())?;
            Ok(Arc::new(ctl) as Arc<dyn BluetoothCapability>)
        });
        let (event_tx, event_rx) = mpsc::channel();

        let app = Self {
            should_quit: false,
            layout: CircularLayout::new(config.display.safe_margin, config.display.cell_aspect),
            show_all_devices: config.bluetooth.show_all_devices,
            config,
            manager,
            coordinator,
            bluetooth,
            capability_factory,
            keybinds: Keybinds,
            show_help: false,
            last_error: None,
            event_tx,
            event_rx,
            last_cleanup: Instant::now(),
            finished_operation_max_age: Duration::from_secs(60),
        };
        app.register_observers();
        Ok(app)
    }
}
