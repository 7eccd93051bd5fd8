use crate::config::Config;
use crate::keybinds::Keybinds;
use crate::setup::{
    ActiveProgress, BluetoothSetupInterface, ControlVisibility, SetupAction, SetupScreen,
    SetupState, SetupStateCoordinator, Slot, StateField, StateUpdate,
};
use crate::ui::layout::CircularLayout;
use crate::ui::panel::PanelType;
use obd_gauge_bluetooth::{BluetoothCapability, BluetoothCtl, PairingStatus};
use obd_gauge_worker::{
    AsyncOperation, AsyncOperationManager, OperationCallback, OperationId, OperationStatus,
    OperationType, WorkerError,
};
use ratatui::crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::layout::Rect;
use ratatui::Frame;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

mod effects;
mod input;
mod render;
mod state;
mod types;

pub use state::App;
pub use types::{CapabilityFactory, SetupEvent};

impl App {
    pub(super) fn report_error(&mut self, context: &str, error: impl std::fmt::Display) {
        let message = format!("{context}: {error}");
        self.last_error = Some(message.clone());
        tracing::warn!("{message}");
    }

    pub(super) fn clear_error(&mut self) {
        self.last_error = None;
    }
}
