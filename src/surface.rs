//! Synthetic sample surfaces for simulated scans
//!
//! A [`SurfaceModel`] maps a lateral position and probe mode to the signal a
//! real instrument would measure there. Surfaces are defined on the scan
//! extent, so the same topography stretches to any scan size.
//!
//! Noise is a deterministic function of the model's seed and the queried
//! position: the same seed always produces the same surface.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::types::ProbeMode;

/// Decay of the tunneling current per unit of surface height
const TUNNEL_DECAY: f64 = 1.0;
/// Non-contact oscillation amplitude far from the surface
const FREE_AMPLITUDE: f64 = 1.0;
/// Fractional amplitude damping at full interaction
const AMPLITUDE_DAMPING: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Topography {
    /// Two superposed sinusoidal gratings
    #[default]
    Sinusoidal,
    /// Flat terraces separated by monatomic-like steps along X
    Stepped { terraces: u32 },
    /// Gaussian depression centred in the scan area
    Pit { width: f64 },
    /// Smooth random height field on a lattice of `cells` per axis
    RandomField { cells: u32 },
    /// Gaussian ridge running along X
    Ridge { width: f64 },
}

impl Topography {
    pub fn stepped() -> Self {
        Topography::Stepped { terraces: 4 }
    }

    pub fn pit() -> Self {
        Topography::Pit { width: 0.15 }
    }

    pub fn random_field() -> Self {
        Topography::RandomField { cells: 8 }
    }

    pub fn ridge() -> Self {
        Topography::Ridge { width: 0.1 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceModel {
    topography: Topography,
    extent: (f64, f64),
    amplitude: f64,
    noise_amplitude: f64,
    seed: u64,
}

impl SurfaceModel {
    /// Model spanning `extent_x` × `extent_y` with a fresh random seed
    pub fn new(topography: Topography, extent_x: f64, extent_y: f64) -> Self {
        Self {
            topography,
            extent: (extent_x.abs().max(f64::EPSILON), extent_y.abs().max(f64::EPSILON)),
            amplitude: 1.0,
            noise_amplitude: 0.0,
            seed: rand::random(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }

    /// Peak magnitude of the uniform noise added to every height
    pub fn with_noise(mut self, noise_amplitude: f64) -> Self {
        self.noise_amplitude = noise_amplitude.abs();
        self
    }

    pub fn topography(&self) -> Topography {
        self.topography
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Expected signal at `(x, y)` for the given probe mode
    ///
    /// Contact and profiling modes report height, STM reports tunneling
    /// current in nA and non-contact AFM reports oscillation amplitude.
    pub fn height_or_signal(&self, x: f64, y: f64, mode: ProbeMode) -> f64 {
        let height = self.height(x, y);
        match mode {
            ProbeMode::AfmContact | ProbeMode::Profiling => height,
            ProbeMode::Stm => (TUNNEL_DECAY * height).exp(),
            ProbeMode::AfmNonContact => FREE_AMPLITUDE * (1.0 - AMPLITUDE_DAMPING * height.tanh()),
        }
    }

    /// Surface height including noise
    pub fn height(&self, x: f64, y: f64) -> f64 {
        self.clean_height(x, y) + self.noise(x, y)
    }

    fn clean_height(&self, x: f64, y: f64) -> f64 {
        let u = x / self.extent.0;
        let v = y / self.extent.1;
        let a = self.amplitude;

        match self.topography {
            Topography::Sinusoidal => {
                a * ((2.0 * PI * u).sin() * (2.0 * PI * v).cos()
                    + 0.25 * (6.0 * PI * u).sin() * (4.0 * PI * v).sin())
            }
            Topography::Stepped { terraces } => {
                let terraces = terraces.max(1) as f64;
                let level = (u.clamp(0.0, 1.0) * terraces).floor().min(terraces - 1.0);
                a * level
            }
            Topography::Pit { width } => {
                let sigma = width.abs().max(f64::EPSILON);
                let r2 = (u - 0.5).powi(2) + (v - 0.5).powi(2);
                -a * (-r2 / (2.0 * sigma * sigma)).exp()
            }
            Topography::RandomField { cells } => a * self.lattice_noise(u, v, cells.max(1)),
            Topography::Ridge { width } => {
                let sigma = width.abs().max(f64::EPSILON);
                a * (-(v - 0.5).powi(2) / (2.0 * sigma * sigma)).exp()
            }
        }
    }

    /// Bilinearly smoothed lattice of seeded values in [-1, 1]
    fn lattice_noise(&self, u: f64, v: f64, cells: u32) -> f64 {
        let gx = u.clamp(0.0, 1.0) * cells as f64;
        let gy = v.clamp(0.0, 1.0) * cells as f64;
        let ix = (gx.floor() as u64).min(cells as u64 - 1);
        let iy = (gy.floor() as u64).min(cells as u64 - 1);
        let fx = smoothstep(gx - ix as f64);
        let fy = smoothstep(gy - iy as f64);

        let corner = |i: u64, j: u64| self.uniform(mix(i, j ^ 0x5bd1_e995));
        let top = lerp(corner(ix, iy), corner(ix + 1, iy), fx);
        let bottom = lerp(corner(ix, iy + 1), corner(ix + 1, iy + 1), fx);
        lerp(top, bottom, fy)
    }

    fn noise(&self, x: f64, y: f64) -> f64 {
        if self.noise_amplitude == 0.0 {
            return 0.0;
        }
        self.noise_amplitude * self.uniform(mix(x.to_bits(), y.to_bits()))
    }

    fn uniform(&self, key: u64) -> f64 {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ key);
        rng.gen_range(-1.0..=1.0)
    }
}

fn mix(a: u64, b: u64) -> u64 {
    // splitmix64 finaliser over both inputs
    let mut z = a.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ b.rotate_left(31);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn smoothstep(t: f64) -> f64 {
    t * t * (3.0 - 2.0 * t)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}
