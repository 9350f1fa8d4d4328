use crate::types::{Position, ScanAxis, ScanConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    /// Rows along Y, sweep direction alternating every row
    Serpentine,
    /// One sweep along the given axis
    Line(ScanAxis),
}

/// Index-based raster position
///
/// Coordinates are computed from grid indices rather than accumulated, so the
/// last point of every sweep lands exactly on the configured range.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterCursor {
    pattern: Pattern,
    resolution: usize,
    x_range: f64,
    y_range: f64,
    index: usize,
}

impl RasterCursor {
    pub fn for_config(config: &ScanConfig) -> Self {
        let pattern = if config.mode().is_area() {
            Pattern::Serpentine
        } else {
            Pattern::Line(config.profile_axis())
        };
        Self {
            pattern,
            resolution: config.resolution(),
            x_range: config.x_range(),
            y_range: config.y_range(),
            index: 0,
        }
    }

    /// Total number of points in the raster
    pub fn total(&self) -> usize {
        match self.pattern {
            Pattern::Serpentine => self.resolution * self.resolution,
            Pattern::Line(_) => self.resolution,
        }
    }

    /// Points already visited
    pub fn visited(&self) -> usize {
        self.index
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.total()
    }

    /// Position of the next point, `None` once past the last one
    pub fn current(&self) -> Option<Position> {
        if self.is_exhausted() {
            return None;
        }
        let (row, column) = self.grid_index(self.index);
        Some(match self.pattern {
            Pattern::Serpentine => Position::new(
                self.coordinate(column, self.x_range),
                self.coordinate(row, self.y_range),
            ),
            Pattern::Line(ScanAxis::X) => Position::new(self.coordinate(column, self.x_range), 0.0),
            Pattern::Line(ScanAxis::Y) => Position::new(0.0, self.coordinate(column, self.y_range)),
        })
    }

    pub fn advance(&mut self) {
        if !self.is_exhausted() {
            self.index += 1;
        }
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// `(row, column)` of the `n`-th visited point
    pub fn grid_index(&self, n: usize) -> (usize, usize) {
        match self.pattern {
            Pattern::Serpentine => {
                let row = n / self.resolution;
                let offset = n % self.resolution;
                let column = if row % 2 == 0 {
                    offset
                } else {
                    self.resolution - 1 - offset
                };
                (row, column)
            }
            Pattern::Line(_) => (0, n),
        }
    }

    fn coordinate(&self, i: usize, range: f64) -> f64 {
        if self.resolution <= 1 {
            return 0.0;
        }
        if i + 1 >= self.resolution {
            return range;
        }
        let step = range / (self.resolution - 1) as f64;
        (i as f64 * step).min(range)
    }
}
