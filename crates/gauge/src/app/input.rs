use super::*;

impl App {
    /// Returns true when the app should exit.
    pub fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => self.handle_key_event(key),
            Event::Mouse(_) => {
                self.coordinator.register_interaction();
                false
            }
            _ => false,
        }
    }

    fn handle_key_event(&mut self, key: KeyEvent) -> bool {
        self.coordinator.register_interaction();

        if key.code == KeyCode::Char('q') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return true;
        }

        if key.code == KeyCode::Char('?') {
            self.show_help = !self.show_help;
            return false;
        }

        if self.show_help {
            if key.code == KeyCode::Esc {
                self.show_help = false;
            }
            return false;
        }

        let state = self.coordinator.get_state();
        match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Enter => self.confirm(&state),
            KeyCode::Esc => {
                self.coordinator.handle_setup_action(SetupAction::Back);
            }
            KeyCode::Char('r') => self.retry(&state),
            KeyCode::Char('c') => {
                self.bluetooth.cancel_operations();
                self.coordinator.handle_setup_action(SetupAction::Cancel);
            }
            KeyCode::Char('s') => {
                self.coordinator
                    .handle_setup_action(SetupAction::StartDiscovery);
                // Already on the screen, so no transition will start it.
                if state.current_screen == SetupScreen::Discovery {
                    self.start_discovery();
                }
            }
            KeyCode::Up => self.move_cursor(&state, -1),
            KeyCode::Down => self.move_cursor(&state, 1),
            KeyCode::Char('a') => {
                self.show_all_devices = !self.show_all_devices;
                tracing::info!("Show all devices: {}", self.show_all_devices);
                if state.current_screen == SetupScreen::Discovery {
                    self.start_discovery();
                }
            }
            _ => {}
        }
        false
    }

    fn confirm(&mut self, state: &SetupState) {
        let action = if state.current_screen == SetupScreen::DeviceList {
            SetupAction::SelectDevice {
                device: state.highlighted_device().cloned(),
            }
        } else {
            SetupAction::Next
        };
        if !self.coordinator.handle_setup_action(action) {
            tracing::debug!("Enter ignored on {}", state.current_screen);
        }
    }

    fn retry(&mut self, state: &SetupState) {
        if !self.coordinator.handle_setup_action(SetupAction::Retry) {
            return;
        }
        // Retrying from the device list moves back to discovery, which
        // starts the scan through the screen transition.
        match state.current_screen {
            SetupScreen::Discovery => self.start_discovery(),
            SetupScreen::Pairing => self.start_pairing(),
            SetupScreen::Test => self.start_connection_test(),
            _ => {}
        }
    }

    fn move_cursor(&mut self, state: &SetupState, delta: isize) {
        if state.current_screen != SetupScreen::DeviceList || state.discovered_devices.is_empty() {
            return;
        }
        let last = state.discovered_devices.len() - 1;
        let offset = state
            .scroll_offset
            .saturating_add_signed(delta)
            .min(last);
        self.coordinator.update(StateUpdate::ScrollOffset(offset));
    }
}
