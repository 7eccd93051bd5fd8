use ratatui::layout::{Constraint, Direction, Layout, Rect};

use super::panel::{Panel, PanelType};

const TITLE_HEIGHT: u16 = 1;
const STATUS_HEIGHT: u16 = 2;
const CONTROLS_HEIGHT: u16 = 1;

/// Places the wizard inside the round display.
///
/// Terminal cells are taller than they are wide, so horizontal distances
/// are measured in cell widths and vertical ones are scaled by
/// `cell_aspect` to keep the circle round.
pub struct CircularLayout {
    safe_margin: f32,
    cell_aspect: f32,
    circle: Rect,
    cached_panels: Vec<Panel>,
}

impl Default for CircularLayout {
    fn default() -> Self {
        Self::new(0.08, 2.0)
    }
}

impl CircularLayout {
    pub fn new(safe_margin: f32, cell_aspect: f32) -> Self {
        Self {
            safe_margin: safe_margin.clamp(0.0, 0.5),
            cell_aspect: if cell_aspect > 0.0 { cell_aspect } else { 1.0 },
            circle: Rect::default(),
            cached_panels: Vec::new(),
        }
    }

    /// Bounding box of the largest circle that fits in `area`.
    pub fn circle_area(&self, area: Rect) -> Rect {
        let diameter = (area.width as f32).min(area.height as f32 * self.cell_aspect);
        let width = (diameter.floor() as u16).min(area.width);
        let height = ((diameter / self.cell_aspect).floor() as u16).min(area.height);
        Rect {
            x: area.x + (area.width - width) / 2,
            y: area.y + (area.height - height) / 2,
            width,
            height,
        }
    }

    /// Cell at `radius_fraction` of the radius and `angle_degrees`
    /// clockwise from twelve o'clock.
    pub fn polar_to_cell(
        &self,
        circle: Rect,
        radius_fraction: f32,
        angle_degrees: f32,
    ) -> (u16, u16) {
        let radius = circle.width as f32 / 2.0 * radius_fraction;
        let (cx, cy) = center(circle);
        let theta = angle_degrees.to_radians();

        let col = cx + radius * theta.sin();
        let row = cy - radius * theta.cos() / self.cell_aspect;

        let max_col = circle.x + circle.width.saturating_sub(1);
        let max_row = circle.y + circle.height.saturating_sub(1);
        (
            (col.round().max(0.0) as u16).clamp(circle.x, max_col),
            (row.round().max(0.0) as u16).clamp(circle.y, max_row),
        )
    }

    /// Largest square (in display terms) inside the circle once the bezel
    /// margin is removed.
    pub fn safe_rect(&self, circle: Rect) -> Rect {
        let radius = circle.width as f32 / 2.0 * (1.0 - self.safe_margin);
        let half_side = radius / std::f32::consts::SQRT_2;
        let (cx, cy) = center(circle);

        let width = ((half_side * 2.0).floor() as u16).min(circle.width);
        let height = ((half_side * 2.0 / self.cell_aspect).floor() as u16).min(circle.height);
        Rect {
            x: ((cx - width as f32 / 2.0).round().max(0.0) as u16).max(circle.x),
            y: ((cy - height as f32 / 2.0).round().max(0.0) as u16).max(circle.y),
            width,
            height,
        }
    }

    pub fn calculate_layout(&mut self, area: Rect) -> &[Panel] {
        self.circle = self.circle_area(area);
        let safe = self.safe_rect(self.circle);

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(TITLE_HEIGHT),
                Constraint::Min(1),
                Constraint::Length(STATUS_HEIGHT),
                Constraint::Length(CONTROLS_HEIGHT),
            ])
            .split(safe);

        self.cached_panels = vec![
            Panel {
                panel_type: PanelType::Title,
                rect: rows[0],
            },
            Panel {
                panel_type: PanelType::Body,
                rect: rows[1],
            },
            Panel {
                panel_type: PanelType::Status,
                rect: rows[2],
            },
            Panel {
                panel_type: PanelType::Controls,
                rect: rows[3],
            },
        ];

        &self.cached_panels
    }

    pub fn get_panels(&self) -> &[Panel] {
        &self.cached_panels
    }

    /// Circle computed by the last [`calculate_layout`](Self::calculate_layout).
    pub fn circle(&self) -> Rect {
        self.circle
    }
}

fn center(rect: Rect) -> (f32, f32) {
    (
        rect.x as f32 + rect.width as f32 / 2.0,
        rect.y as f32 + rect.height as f32 / 2.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circle_fits_wide_terminal() {
        let layout = CircularLayout::new(0.08, 2.0);
        let circle = layout.circle_area(Rect::new(0, 0, 120, 40));
        assert_eq!(circle, Rect::new(20, 0, 80, 40));
    }

    #[test]
    fn circle_fits_tall_terminal() {
        let layout = CircularLayout::new(0.08, 2.0);
        let circle = layout.circle_area(Rect::new(0, 0, 40, 60));
        assert_eq!(circle, Rect::new(0, 20, 40, 20));
    }

    #[test]
    fn polar_points_land_on_the_rim() {
        let layout = CircularLayout::new(0.0, 2.0);
        let circle = Rect::new(0, 0, 80, 40);

        assert_eq!(layout.polar_to_cell(circle, 1.0, 0.0), (40, 0));
        assert_eq!(layout.polar_to_cell(circle, 1.0, 90.0), (79, 20));
        assert_eq!(layout.polar_to_cell(circle, 1.0, 180.0), (40, 39));
        assert_eq!(layout.polar_to_cell(circle, 1.0, 270.0), (0, 20));
        assert_eq!(layout.polar_to_cell(circle, 0.0, 123.0), (40, 20));
    }

    #[test]
    fn safe_rect_is_inside_the_circle() {
        let layout = CircularLayout::new(0.08, 2.0);
        let circle = Rect::new(20, 0, 80, 40);
        let safe = layout.safe_rect(circle);

        let (cx, cy) = center(circle);
        let radius = circle.width as f32 / 2.0;
        for (col, row) in [
            (safe.x, safe.y),
            (safe.right(), safe.y),
            (safe.x, safe.bottom()),
            (safe.right(), safe.bottom()),
        ] {
            let dx = col as f32 - cx;
            let dy = (row as f32 - cy) * 2.0;
            assert!((dx * dx + dy * dy).sqrt() <= radius, "({col}, {row}) outside");
        }
        assert!(safe.width >= 50);
        assert!(safe.height >= 25);
    }

    #[test]
    fn panels_stack_inside_safe_area() {
        let mut layout = CircularLayout::default();
        let panels = layout.calculate_layout(Rect::new(0, 0, 120, 40)).to_vec();
        assert_eq!(panels.len(), 4);
        assert_eq!(panels[0].panel_type, PanelType::Title);
        assert_eq!(panels[0].rect.height, TITLE_HEIGHT);
        assert_eq!(panels[3].panel_type, PanelType::Controls);

        let safe = layout.safe_rect(layout.circle());
        for panel in &panels {
            assert!(safe.contains(panel.rect.as_position()));
        }
    }

    #[test]
    fn tiny_area_does_not_panic() {
        let mut layout = CircularLayout::default();
        layout.calculate_layout(Rect::new(0, 0, 1, 1));
        layout.calculate_layout(Rect::new(0, 0, 0, 0));
        let circle = layout.circle();
        let _ = layout.polar_to_cell(circle, 1.0, 45.0);
    }
}
