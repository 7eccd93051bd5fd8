use super::*;

pub(super) const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

impl App {
    /// Probes the Bluetooth controller in the background.
    pub fn init(&mut self) {
        let factory = self.capability_factory.clone();
        self.bluetooth.initialize(move || factory());
    }

    pub(super) fn register_observers(&self) {
        let tx = self.event_tx.clone();
        self.coordinator
            .register_screen_transition_callback(move |from, to| {
                let _ = tx.send(SetupEvent::ScreenChanged { from, to });
            });

        let tx = self.event_tx.clone();
        self.coordinator.register_state_change_callback(move |fields| {
            let _ = tx.send(SetupEvent::StateChanged(fields.to_vec()));
        });
    }

    fn operation_callback(&self) -> OperationCallback {
        let tx = self.event_tx.clone();
        Arc::new(move |op: &AsyncOperation| {
            if op.is_terminal() {
                let _ = tx.send(SetupEvent::OperationFinished {
                    id: op.id,
                    operation_type: op.operation_type,
                    status: op.status,
                    error: op.error_message(),
                });
            }
        })
    }

    pub(super) fn start_discovery(&mut self) {
        if self.bluetooth.needs_initialization() {
            tracing::info!("Bluetooth unavailable, initialising again");
            self.init();
        }
        let callback = self.operation_callback();
        self.bluetooth
            .start_discovery(Some(callback), None, self.show_all_devices);
    }

    pub(super) fn start_pairing(&mut self) {
        match self.coordinator.get_state().selected_device {
            Some(device) => {
                let callback = self.operation_callback();
                self.bluetooth.start_pairing(device, Some(callback));
            }
            None => self.report_error("Cannot pair", "no adapter selected"),
        }
    }

    pub(super) fn start_connection_test(&mut self) {
        match self.coordinator.get_state().selected_device {
            Some(device) => {
                let callback = self.operation_callback();
                self.bluetooth.start_connection_test(device, Some(callback));
            }
            None => self.report_error("Cannot test", "no adapter selected"),
        }
    }

    /// Reacts to everything that happened since the last frame.
    pub fn process_setup_events(&mut self) {
        self.sweep_finished_operations();
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                SetupEvent::ScreenChanged { from, to } => {
                    tracing::debug!("Screen changed {} -> {}", from, to);
                    self.clear_error();
                    match to {
                        SetupScreen::Discovery => self.start_discovery(),
                        SetupScreen::Pairing => self.start_pairing(),
                        SetupScreen::Test => self.start_connection_test(),
                        _ => {}
                    }
                }
                SetupEvent::StateChanged(fields) => {
                    if fields.contains(&StateField::DiscoveredDevices) {
                        self.clamp_cursor();
                    }
                }
                SetupEvent::OperationFinished {
                    id,
                    operation_type,
                    status,
                    error,
                } => {
                    tracing::debug!("{} {} finished: {:?}", operation_type, id, status);
                    if let Some(error) = error {
                        tracing::debug!("{} {} error: {}", operation_type, id, error);
                    }
                    if operation_type == OperationType::DeviceDiscovery
                        && status == OperationStatus::Completed
                    {
                        self.advance_after_discovery(id);
                    }
                }
            }
        }
    }

    fn advance_after_discovery(&mut self, id: OperationId) {
        if self.bluetooth.slot_operation(Slot::Discovery) != Some(id) {
            return;
        }
        let state = self.coordinator.get_state();
        if state.current_screen == SetupScreen::Discovery && !state.discovered_devices.is_empty()
        {
            self.coordinator.handle_setup_action(SetupAction::Next);
        }
    }

    fn sweep_finished_operations(&mut self) {
        if self.last_cleanup.elapsed() < CLEANUP_INTERVAL {
            return;
        }
        self.last_cleanup = Instant::now();
        self.manager
            .cleanup_completed_operations(self.finished_operation_max_age);
    }

    fn clamp_cursor(&mut self) {
        let state = self.coordinator.get_state();
        let last = state.discovered_devices.len().saturating_sub(1);
        if state.scroll_offset > last {
            self.coordinator.update(StateUpdate::ScrollOffset(last));
        }
    }

    /// Cancels outstanding Bluetooth work and stops the worker pool.
    pub fn shutdown(&mut self) {
        self.bluetooth.cancel_operations();
        self.manager.stop();
    }
}
