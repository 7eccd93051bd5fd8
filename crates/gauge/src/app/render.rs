use super::*;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Position};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Gauge, List, ListItem, ListState, Paragraph, Wrap};

const RING_DOTS: usize = 48;

impl App {
    pub fn render(&mut self, frame: &mut Frame) {
        let area = frame.area();
        let state = self.coordinator.get_state();
        let progress = self.bluetooth.get_active_operation_progress();

        self.layout.calculate_layout(area);
        self.render_ring(frame, &state, &progress);

        let panels = self.layout.get_panels().to_vec();
        for panel in panels {
            match panel.panel_type {
                PanelType::Title => self.render_title(frame, panel.rect, &state),
                PanelType::Body => self.render_body(frame, panel.rect, &state, &progress),
                PanelType::Status => self.render_status(frame, panel.rect, &state, &progress),
                PanelType::Controls => self.render_controls(frame, panel.rect, &state),
            }
        }

        if self.show_help {
            self.render_help(frame, area);
        }
    }

    /// Dots around the bezel, lit clockwise with the active operation.
    fn render_ring(&self, frame: &mut Frame, state: &SetupState, progress: &ActiveProgress) {
        let circle = self.layout.circle();
        if circle.width < 4 || circle.height < 2 {
            return;
        }

        let fraction = if progress.has_active_operations {
            progress.progress
        } else if state.setup_complete {
            1.0
        } else {
            0.0
        };
        let color = status_color(state.pairing_status);

        for i in 0..RING_DOTS {
            let angle = i as f32 * 360.0 / RING_DOTS as f32;
            let (col, row) = self.layout.polar_to_cell(circle, 1.0, angle);
            let lit = (i as f32) < fraction * RING_DOTS as f32;
            if let Some(cell) = frame.buffer_mut().cell_mut(Position::new(col, row)) {
                if lit {
                    cell.set_symbol("●").set_fg(color);
                } else {
                    cell.set_symbol("·").set_fg(Color::DarkGray);
                }
            }
        }
    }

    fn render_title(&self, frame: &mut Frame, area: Rect, state: &SetupState) {
        let title = Paragraph::new(state.current_screen.title())
            .style(Style::default().add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center);
        frame.render_widget(title, area);
    }

    fn render_body(
        &self,
        frame: &mut Frame,
        area: Rect,
        state: &SetupState,
        progress: &ActiveProgress,
    ) {
        let device_name = state
            .selected_device
            .as_ref()
            .map(|d| d.display_name().to_string())
            .unwrap_or_else(|| "no adapter".to_string());

        let lines: Vec<Line> = match state.current_screen {
            SetupScreen::Welcome => vec![
                Line::from("OBD-II RPM Gauge"),
                Line::from(""),
                Line::from("Plug the adapter into the"),
                Line::from("OBD port and turn the ignition on."),
                Line::from(""),
                Line::from("Press Enter to search."),
            ],
            SetupScreen::Discovery => {
                self.render_discovery(frame, area, state);
                return;
            }
            SetupScreen::DeviceList => {
                self.render_device_list(frame, area, state);
                return;
            }
            SetupScreen::Pairing => {
                let mut lines = vec![
                    Line::from(format!("Pairing with {device_name}")),
                    Line::from(""),
                    Line::from(state.pairing_status.to_string()),
                ];
                if state.pairing_status == PairingStatus::Success {
                    lines.push(Line::from(""));
                    lines.push(Line::from("Press Enter to test the adapter."));
                }
                lines
            }
            SetupScreen::Test => {
                let mut lines = vec![
                    Line::from(format!("Talking to {device_name}")),
                    Line::from(""),
                ];
                if progress.operation_type == Some(OperationType::ObdConnectionTest) {
                    lines.push(Line::from(progress.message.clone()));
                } else if state
                    .selected_device
                    .as_ref()
                    .is_some_and(|d| d.connection_verified)
                {
                    lines.push(Line::from("Adapter answered. Press Enter to finish."));
                } else {
                    lines.push(Line::from(state.pairing_status.to_string()));
                }
                lines
            }
            SetupScreen::Complete => vec![
                Line::from("Setup complete"),
                Line::from(""),
                Line::from(format!("Using {device_name}")),
            ],
            SetupScreen::CurrentDevice => vec![Line::from(format!("Current adapter: {device_name}"))],
            SetupScreen::DeviceManagement => vec![
                Line::from("Saved adapters are not managed here."),
                Line::from("Press s to search again."),
            ],
            SetupScreen::Confirmation => vec![Line::from("Press Enter to confirm.")],
        };

        frame.render_widget(
            Paragraph::new(lines)
                .alignment(Alignment::Center)
                .wrap(Wrap { trim: true }),
            area,
        );
    }

    fn render_discovery(&self, frame: &mut Frame, area: Rect, state: &SetupState) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(1)])
            .split(area);

        let filter = if self.show_all_devices {
            "all devices"
        } else {
            "OBD adapters"
        };
        let text = vec![
            Line::from(format!("Searching for {filter}")),
            Line::from(""),
            Line::from(format!("{} found", state.discovered_devices.len())),
        ];
        frame.render_widget(Paragraph::new(text).alignment(Alignment::Center), rows[0]);

        let gauge = Gauge::default()
            .gauge_style(Style::default().fg(Color::Cyan))
            .ratio(f64::from(state.discovery_progress).clamp(0.0, 1.0));
        frame.render_widget(gauge, rows[1]);
    }

    fn render_device_list(&self, frame: &mut Frame, area: Rect, state: &SetupState) {
        if state.discovered_devices.is_empty() {
            frame.render_widget(
                Paragraph::new("No adapters found. Press r to search again.")
                    .alignment(Alignment::Center)
                    .wrap(Wrap { trim: true }),
                area,
            );
            return;
        }

        let items: Vec<ListItem> = state
            .discovered_devices
            .iter()
            .map(|device| {
                let signal = device
                    .signal_strength
                    .map(|rssi| format!(" {rssi} dBm"))
                    .unwrap_or_default();
                let style = if device.is_likely_obd() {
                    Style::default().fg(Color::Green)
                } else {
                    Style::default()
                };
                ListItem::new(Line::from(vec![
                    Span::styled(device.display_name().to_string(), style),
                    Span::styled(
                        format!("  {}{}", device.device_classification.label(), signal),
                        Style::default().fg(Color::DarkGray),
                    ),
                ]))
            })
            .collect();

        let list = List::new(items)
            .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
            .highlight_symbol("> ");
        let mut list_state = ListState::default().with_selected(Some(state.scroll_offset));
        frame.render_stateful_widget(list, area, &mut list_state);
    }

    fn render_status(
        &self,
        frame: &mut Frame,
        area: Rect,
        state: &SetupState,
        progress: &ActiveProgress,
    ) {
        let mut lines = Vec::new();
        if let Some(error) = state.error_message.as_ref().or(self.last_error.as_ref()) {
            lines.push(Line::styled(error.clone(), Style::default().fg(Color::Red)));
        } else if progress.has_active_operations && !progress.message.is_empty() {
            lines.push(Line::styled(
                progress.message.clone(),
                Style::default().fg(Color::Cyan),
            ));
        }
        frame.render_widget(
            Paragraph::new(lines)
                .alignment(Alignment::Center)
                .wrap(Wrap { trim: true }),
            area,
        );
    }

    fn render_controls(&self, frame: &mut Frame, area: Rect, state: &SetupState) {
        let alpha = self.coordinator.controls_alpha();
        if alpha == 0 {
            return;
        }
        let hint = Paragraph::new(self.keybinds.controls_hint(state.current_screen))
            .style(Style::default().fg(Color::Rgb(alpha, alpha, alpha)))
            .alignment(Alignment::Center);
        frame.render_widget(hint, area);
    }

    fn render_help(&self, frame: &mut Frame, area: Rect) {
        let help_text = self.keybinds.help_text();
        let popup_area = self.centered_rect(60, 70, area);

        frame.render_widget(Clear, popup_area);
        frame.render_widget(
            Paragraph::new(help_text).block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(" Help - Press ? to close "),
            ),
            popup_area,
        );
    }

    fn centered_rect(&self, percent_x: u16, percent_y: u16, r: Rect) -> Rect {
        let popup_layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Percentage((100 - percent_y) / 2),
                Constraint::Percentage(percent_y),
                Constraint::Percentage((100 - percent_y) / 2),
            ])
            .split(r);

        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage((100 - percent_x) / 2),
                Constraint::Percentage(percent_x),
                Constraint::Percentage((100 - percent_x) / 2),
            ])
            .split(popup_layout[1])[1]
    }
}

fn status_color(status: PairingStatus) -> Color {
    match status {
        PairingStatus::Success => Color::Green,
        PairingStatus::Failed => Color::Red,
        _ => Color::Cyan,
    }
}
