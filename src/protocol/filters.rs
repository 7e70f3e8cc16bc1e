//! Audio filter configuration and ffmpeg argument assembly.

use serde::Deserialize;

/// Center frequencies of the fifteen equalizer bands, in Hz.
const EQ_BANDS: [u32; 15] = [
    25, 40, 63, 100, 160, 250, 400, 630, 1000, 1600, 2500, 4000, 6300, 10000, 16000,
];

/// A client-supplied filter configuration.
///
/// Every section is optional; an entirely empty spec removes all filtering.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterSpec {
    pub volume: Option<f64>,
    pub equalizer: Option<Vec<Band>>,
    pub timescale: Option<Timescale>,
    pub tremolo: Option<Oscillation>,
    pub vibrato: Option<Oscillation>,
    pub rotation: Option<Rotation>,
    pub low_pass: Option<LowPass>,
}

/// A single equalizer band adjustment.
#[derive(Clone, Debug, Deserialize)]
pub struct Band {
    pub band: usize,
    pub gain: f64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Timescale {
    pub rate: f64,
    pub pitch: f64,
    pub speed: f64,
}

impl Default for Timescale {
    fn default() -> Timescale {
        Timescale {
            rate: 1.0,
            pitch: 1.0,
            speed: 1.0,
        }
    }
}

/// Shared shape of the `tremolo` and `vibrato` filters.
#[derive(Clone, Debug, Deserialize)]
pub struct Oscillation {
    pub frequency: f64,
    pub depth: f64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LowPass {
    pub smoothing: f64,
}

impl FilterSpec {
    /// Assembles the `-af` filter graph stages, in a fixed order.
    pub fn to_graph(&self) -> Vec<String> {
        let mut graph = Vec::new();

        if let Some(volume) = self.volume {
            graph.push(format!("volume={}", volume));
        }

        if let Some(bands) = &self.equalizer {
            // explicit 15-band table; entries outside it are ignored and
            // bands left at unity gain are omitted from the graph
            let mut gains = [1.0f64; 15];
            for band in bands {
                if band.band < gains.len() {
                    gains[band.band] = band.gain;
                }
            }

            for (gain, freq) in gains.iter().zip(EQ_BANDS) {
                let db = (gain.max(0.015625).log2() * 12.0).round();
                if db != 0.0 {
                    graph.push(format!("equalizer=f={}:width_type=h:width=1:g={}", freq, db));
                }
            }
        }

        if let Some(timescale) = &self.timescale {
            let finalspeed = (timescale.speed + (1.0 - timescale.pitch)).clamp(0.5, 100.0);
            let setrate = 48000.0 * (timescale.pitch + (1.0 - timescale.rate));

            graph.push(String::from("aresample=48000"));
            graph.push(format!("asetrate={}", setrate));
            graph.push(format!("atempo={}", finalspeed));
            graph.push(String::from("aresample=48000"));
        }

        if let Some(tremolo) = &self.tremolo {
            graph.push(format!("tremolo=f={}:d={}", tremolo.frequency, tremolo.depth));
        }

        if let Some(vibrato) = &self.vibrato {
            graph.push(format!("vibrato=f={}:d={}", vibrato.frequency, vibrato.depth));
        }

        if let Some(rotation) = &self.rotation {
            graph.push(format!("apulsator=hz={}", rotation.rotation_hz));
        }

        if let Some(low_pass) = &self.low_pass {
            graph.push(format!("lowpass=f={}", 500.0 / low_pass.smoothing));
        }

        graph
    }

    /// The playback rate the position computation must account for.
    pub fn playback_rate(&self) -> f64 {
        self.timescale.as_ref().map(|t| t.speed).unwrap_or(1.0)
    }
}

/// The filter state of a queue, read at ffmpeg argv-construction time.
#[derive(Clone, Debug, Default)]
pub struct FilterChain {
    /// Seek offset applied with `-ss`.
    pub seek_ms: Option<u64>,
    /// Assembled `-af` stages.
    pub graph: Vec<String>,
    /// Raw argument override from the `ffmpeg` op; replaces `graph`.
    pub raw: Option<Vec<String>>,
    /// Playback rate for position math.
    pub rate: f64,
}

impl FilterChain {
    pub fn new() -> FilterChain {
        FilterChain {
            rate: 1.0,
            ..FilterChain::default()
        }
    }

    /// Replaces the filter stages from a spec, preserving any active seek.
    pub fn apply(&mut self, spec: &FilterSpec) {
        self.graph = spec.to_graph();
        self.rate = spec.playback_rate();
        self.raw = None;
    }

    /// Replaces the whole output argument list with raw ffmpeg arguments.
    pub fn apply_raw(&mut self, args: Vec<String>) {
        self.raw = Some(args);
        self.graph.clear();
        self.rate = 1.0;
    }

    /// True when the chain requires no transcoding at all.
    pub fn is_empty(&self) -> bool {
        self.seek_ms.is_none() && self.graph.is_empty() && self.raw.is_none()
    }

    /// Arguments placed before `-i -`.
    pub fn input_args(&self) -> Vec<String> {
        match self.seek_ms {
            Some(ms) => vec![
                String::from("-ss"),
                format!("{}ms", ms),
                String::from("-accurate_seek"),
            ],
            None => Vec::new(),
        }
    }

    /// Arguments placed after the output format options.
    pub fn output_args(&self) -> Vec<String> {
        if let Some(raw) = &self.raw {
            raw.clone()
        } else if self.graph.is_empty() {
            Vec::new()
        } else {
            vec![String::from("-af"), self.graph.join(",")]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> FilterSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn empty_spec_builds_no_graph() {
        assert!(spec("{}").to_graph().is_empty());
    }

    #[test]
    fn volume_stage() {
        assert_eq!(spec(r#"{"volume":0.5}"#).to_graph(), ["volume=0.5"]);
    }

    #[test]
    fn equalizer_maps_gain_to_db() {
        let graph = spec(r#"{"equalizer":[{"band":0,"gain":2.0},{"band":14,"gain":1.0}]}"#)
            .to_graph();

        // log2(2) * 12 = 12 dB; unity bands are dropped
        assert_eq!(graph, ["equalizer=f=25:width_type=h:width=1:g=12"]);
    }

    #[test]
    fn equalizer_ignores_out_of_range_bands() {
        let graph = spec(r#"{"equalizer":[{"band":40,"gain":2.0}]}"#).to_graph();

        assert!(graph.is_empty());
    }

    #[test]
    fn timescale_stages_and_rate() {
        let spec = spec(r#"{"timescale":{"speed":2.0}}"#);

        assert_eq!(
            spec.to_graph(),
            ["aresample=48000", "asetrate=48000", "atempo=2", "aresample=48000"],
        );
        assert_eq!(spec.playback_rate(), 2.0);
    }

    #[test]
    fn identity_timescale_keeps_unit_rate() {
        let spec = spec(r#"{"timescale":{"rate":1.0,"pitch":1.0,"speed":1.0}}"#);

        assert_eq!(spec.playback_rate(), 1.0);
    }

    #[test]
    fn stage_ordering() {
        let graph = spec(
            r#"{
                "volume": 2.0,
                "tremolo": {"frequency": 4.0, "depth": 0.75},
                "vibrato": {"frequency": 2.0, "depth": 0.5},
                "rotation": {"rotationHz": 0.2},
                "lowPass": {"smoothing": 20.0}
            }"#,
        )
        .to_graph();

        assert_eq!(
            graph,
            [
                "volume=2",
                "tremolo=f=4:d=0.75",
                "vibrato=f=2:d=0.5",
                "apulsator=hz=0.2",
                "lowpass=f=25",
            ],
        );
    }

    #[test]
    fn chain_seek_args() {
        let mut chain = FilterChain::new();
        assert!(chain.is_empty());

        chain.seek_ms = Some(1500);
        assert_eq!(chain.input_args(), ["-ss", "1500ms", "-accurate_seek"]);
        assert!(!chain.is_empty());
    }

    #[test]
    fn chain_apply_preserves_seek() {
        let mut chain = FilterChain::new();
        chain.seek_ms = Some(1000);
        chain.apply(&spec(r#"{"volume":0.1}"#));

        assert_eq!(chain.seek_ms, Some(1000));
        assert_eq!(chain.output_args(), ["-af", "volume=0.1"]);
    }

    #[test]
    fn raw_args_override_graph() {
        let mut chain = FilterChain::new();
        chain.apply(&spec(r#"{"volume":0.1}"#));
        chain.apply_raw(vec![String::from("-af"), String::from("anull")]);

        assert_eq!(chain.output_args(), ["-af", "anull"]);
        assert_eq!(chain.rate, 1.0);
    }
}
