//! The incremental reconstruction engine.
//!
//! A single control thread drives a small state machine: filter the
//! view-pair graph, build tracks, seed a two-view reconstruction, then
//! grow it view by view, interleaving bundle adjustment with outlier
//! pruning. CPU-bound scoring and triangulation loops fan out over a
//! rayon pool; the landmark map is the only contended resource and is
//! mutated under a mutex during parallel growth.

pub mod outliers;
mod resection;
mod seeding;

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ba::{BaError, BaOptions, BundleAdjuster, LmBundleAdjuster};
use crate::estimation::{
    EssentialRansac, EstimationError, Localizer, PnpRansac, RansacOptions, TwoViewEstimator,
};
use crate::graph::{filter_pairs, largest_biedge_component};
use crate::scene::{Scene, TrackId, ViewId};
use crate::tracks::{
    build_tracks, tracks_per_view, FeaturesProvider, MatchesProvider, Pair, PairwiseMatches,
    Tracks,
};

pub use seeding::{AutomaticSeed, CallbackSeed, PresetSeed, ScoredPair, SeedStrategy};

/// Engine configuration; every threshold of the growth policy lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum two-view inlier count for a seed pair.
    pub min_seed_inliers: usize,
    /// Acceptable median triangulation angle for a seed pair, degrees,
    /// both bounds exclusive.
    pub seed_angle_range: (f64, f64),
    /// Minimum parallax for accepting any triangulated point, degrees.
    pub min_parallax_deg: f64,
    /// A view joins the resection batch when its 2D-3D score reaches
    /// this fraction of the best score.
    pub resection_group_ratio: f64,
    /// Per-axis pixel threshold of the residual rejection pass.
    pub outlier_pixel_threshold: f64,
    /// Observations that must be removed before another refine cycle
    /// is considered worthwhile.
    pub outlier_min_removed: usize,
    /// Poses observed by fewer landmarks than this are erased as
    /// unstable.
    pub min_pose_landmarks: usize,
    /// Half-width of the sliding view-id window restricting resection
    /// candidates; `None` leaves the candidate pool unrestricted.
    pub window: Option<u32>,
    /// LM iterations for the post-resection pose polish.
    pub refine_iterations: usize,
    pub ransac: RansacOptions,
    pub ba: BaOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_seed_inliers: 100,
            seed_angle_range: (3.0, 60.0),
            min_parallax_deg: 2.0,
            resection_group_ratio: 0.75,
            outlier_pixel_threshold: 4.0,
            outlier_min_removed: 50,
            min_pose_landmarks: 6,
            window: None,
            refine_iterations: 50,
            ransac: RansacOptions::default(),
            ba: BaOptions::default(),
        }
    }
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Seeding,
    Growing,
    Done,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Init => "INIT",
            EngineState::Seeding => "SEEDING",
            EngineState::Growing => "GROWING",
            EngineState::Done => "DONE",
            EngineState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// Fatal conditions that abort the whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("view graph has no 2-edge-connected component with at least two views")]
    EmptyGraph,
    #[error("no tracks could be built from the pairwise matches")]
    NoTracks,
    #[error("no qualifying seed pair")]
    NoSeedPair,
    #[error("seed pair two-view estimation failed")]
    SeedEstimation(#[source] EstimationError),
    #[error("seed refinement failed")]
    SeedRefinement(#[source] BaError),
    #[error("no triangulated point survived the seed filters")]
    EmptySeedStructure,
}

/// Incremental Structure-from-Motion driver.
///
/// Owns the scene it grows plus the mutable bookkeeping sets; the
/// estimation collaborators are injected and replaceable.
pub struct ReconstructionEngine<'a> {
    pub(crate) scene: Scene,
    pub(crate) features: &'a dyn FeaturesProvider,
    matches: &'a dyn MatchesProvider,
    pub(crate) two_view: Box<dyn TwoViewEstimator>,
    pub(crate) localizer: Box<dyn Localizer>,
    pub(crate) ba: Box<dyn BundleAdjuster>,
    seed_strategy: Box<dyn SeedStrategy>,
    pub(crate) config: EngineConfig,
    state: EngineState,

    pub(crate) tracks: Tracks,
    pub(crate) tracks_per_view: HashMap<ViewId, BTreeSet<TrackId>>,
    pub(crate) filtered_pairs: Vec<Pair>,
    /// Views not yet reconstructed.
    pub(crate) remaining: BTreeSet<ViewId>,
    /// Views with a committed pose.
    pub(crate) reconstructed: BTreeSet<ViewId>,
    /// Current sliding-window half-width, grown on demand.
    pub(crate) window_width: u32,
    /// Residual precision stored per reconstructed view, pixels.
    pub(crate) view_thresholds: HashMap<ViewId, f64>,
}

impl<'a> ReconstructionEngine<'a> {
    pub fn new(
        scene: Scene,
        features: &'a dyn FeaturesProvider,
        matches: &'a dyn MatchesProvider,
        config: EngineConfig,
    ) -> Self {
        let window_width = config.window.unwrap_or(0);
        Self {
            scene,
            features,
            matches,
            two_view: Box::new(EssentialRansac::new(config.ransac.clone())),
            localizer: Box::new(PnpRansac::new(config.ransac.clone())),
            ba: Box::new(LmBundleAdjuster::default()),
            seed_strategy: Box::new(AutomaticSeed),
            config,
            state: EngineState::Init,
            tracks: Tracks::new(),
            tracks_per_view: HashMap::new(),
            filtered_pairs: Vec::new(),
            remaining: BTreeSet::new(),
            reconstructed: BTreeSet::new(),
            window_width,
            view_thresholds: HashMap::new(),
        }
    }

    pub fn with_two_view_estimator(mut self, estimator: Box<dyn TwoViewEstimator>) -> Self {
        self.two_view = estimator;
        self
    }

    pub fn with_localizer(mut self, localizer: Box<dyn Localizer>) -> Self {
        self.localizer = localizer;
        self
    }

    pub fn with_bundle_adjuster(mut self, ba: Box<dyn BundleAdjuster>) -> Self {
        self.ba = ba;
        self
    }

    pub fn with_seed_strategy(mut self, strategy: Box<dyn SeedStrategy>) -> Self {
        self.seed_strategy = strategy;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn into_scene(self) -> Scene {
        self.scene
    }

    /// Run the full reconstruction. Returns true on success; every
    /// failure detail is logged, the contract is the boolean.
    pub fn process(&mut self) -> bool {
        match self.try_process() {
            Ok(()) => {
                if let Some(stats) = self.scene.residual_stats() {
                    info!(
                        observations = stats.count,
                        mean_px = stats.mean,
                        median_px = stats.median,
                        max_px = stats.max,
                        "reconstruction finished"
                    );
                }
                true
            }
            Err(err) => {
                self.set_state(EngineState::Failed);
                warn!(error = %err, "reconstruction failed");
                false
            }
        }
    }

    /// Run the full reconstruction, surfacing the fatal error cause.
    pub fn try_process(&mut self) -> Result<(), EngineError> {
        self.filter_graph()?;
        self.build_tracks()?;

        self.set_state(EngineState::Seeding);
        let pair = self.choose_seed_pair()?;
        self.seed(pair)?;

        self.set_state(EngineState::Growing);
        self.grow();
        self.finalize();

        self.set_state(EngineState::Done);
        Ok(())
    }

    fn set_state(&mut self, next: EngineState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "engine state");
            self.state = next;
        }
    }

    /// Keep only the largest 2-edge-connected component of the pair
    /// graph; views outside it never take part in reconstruction.
    fn filter_graph(&mut self) -> Result<(), EngineError> {
        let pairs = self.matches.pairs();
        let keep = largest_biedge_component(&pairs);
        if keep.len() < 2 {
            return Err(EngineError::EmptyGraph);
        }
        self.filtered_pairs = filter_pairs(&pairs, &keep);
        self.remaining = keep
            .iter()
            .copied()
            .filter(|v| self.scene.views.contains_key(v))
            .collect();
        if self.remaining.len() < 2 {
            return Err(EngineError::EmptyGraph);
        }
        info!(
            kept = self.remaining.len(),
            pairs = self.filtered_pairs.len(),
            "connectivity filter"
        );
        Ok(())
    }

    fn build_tracks(&mut self) -> Result<(), EngineError> {
        let mut filtered = PairwiseMatches::new();
        for &pair in &self.filtered_pairs {
            if let Some(matches) = self.matches.matches_for(pair) {
                filtered.insert(pair.0, pair.1, matches.to_vec());
            }
        }
        self.tracks = build_tracks(&filtered);
        if self.tracks.is_empty() {
            return Err(EngineError::NoTracks);
        }
        self.tracks_per_view = tracks_per_view(&self.tracks);
        info!(tracks = self.tracks.len(), "track building");
        Ok(())
    }

    /// Growth loop: pick a candidate batch, resect each view, then
    /// refine and prune while it pays off. Per-view failures only drop
    /// that view from the pool.
    fn grow(&mut self) {
        loop {
            let candidates = self.select_resection_candidates();
            if candidates.is_empty() {
                break;
            }
            let mut any_success = false;
            for view in candidates {
                let resected = self.resect_view(view);
                self.remaining.remove(&view);
                if resected {
                    self.reconstructed.insert(view);
                    any_success = true;
                }
            }
            if any_success {
                self.refine_and_prune();
            }
        }
    }

    /// Refine, reject outliers, then drop unstable poses; repeat while
    /// enough observations get removed for another cycle to be
    /// worthwhile. The stability cleanup runs after every rejection
    /// round, not only the productive ones.
    fn refine_and_prune(&mut self) {
        loop {
            if let Err(err) = self.ba.adjust(&mut self.scene, &self.config.ba) {
                warn!(error = %err, "bundle adjustment skipped");
                break;
            }
            let removed = outliers::reject_outliers(
                &mut self.scene,
                self.config.outlier_pixel_threshold,
                self.config.min_parallax_deg,
            );
            self.prune_unstable();
            if removed <= self.config.outlier_min_removed {
                break;
            }
        }
    }

    /// Terminal cleanup: one unconditional rejection pass so the final
    /// scene carries no residual outliers.
    fn finalize(&mut self) {
        let removed = outliers::reject_outliers(
            &mut self.scene,
            self.config.outlier_pixel_threshold,
            self.config.min_parallax_deg,
        );
        if removed > 0 {
            info!(removed, "final outlier pass");
        }
        self.prune_unstable();
    }

    fn prune_unstable(&mut self) {
        if outliers::erase_unstable(&mut self.scene, self.config.min_pose_landmarks) {
            let scene = &self.scene;
            self.reconstructed.retain(|&v| scene.is_reconstructed(v));
        }
    }
}
