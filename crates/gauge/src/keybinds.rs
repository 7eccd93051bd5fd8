use crate::setup::SetupScreen;

pub struct Keybinds;

impl Default for Keybinds {
    fn default() -> Self {
        Self
    }
}

impl Keybinds {
    pub fn help_text(&self) -> String {
        r#"Keyboard Shortcuts:

Wizard:
  Enter         Next / select adapter
  Esc           Back
  r             Retry
  c             Cancel and start over
  s             Search for adapters

Device list:
  ↑ / ↓         Move selection
  a             Show all devices / OBD only

General:
  ?             Toggle this help
  q, Ctrl + Q   Quit
"#
        .to_string()
    }

    /// One-line hint shown at the bottom of the dial.
    pub fn controls_hint(&self, screen: SetupScreen) -> &'static str {
        match screen {
            SetupScreen::Welcome => "[Enter] start  [q] quit",
            SetupScreen::Discovery => "[c] cancel  [r] rescan",
            SetupScreen::DeviceList => "[↑↓] pick  [Enter] pair  [Esc] back",
            SetupScreen::Pairing => "[Enter] test  [r] retry  [Esc] back",
            SetupScreen::Test => "[Enter] finish  [r] retry  [Esc] back",
            SetupScreen::Complete => "[Esc] back  [q] quit",
            SetupScreen::CurrentDevice
            | SetupScreen::DeviceManagement
            | SetupScreen::Confirmation => "[Esc] back",
        }
    }
}
