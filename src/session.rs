//! The collect → train → listen state machine.
//!
//! One controller owns the dataset, the current classifier and the single
//! stream subscription. Every transition goes through `&mut self`, so the
//! collection path and the training path can never overlap.

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::classes::ClassList;
use crate::classifier::{Classifier, FitHistory, FitOptions};
use crate::config::{Config, StreamConfig};
use crate::dataset::{Dataset, Example};
use crate::display::{Controls, DisplaySink};
use crate::error::{Result, SessionError, StreamError};
use crate::network::Topology;
use crate::preprocessing::prepare_window;
use crate::reporter::ResultReporter;
use crate::store::{ModelLocation, ModelStore};
use crate::stream::{FeatureStream, SpectrogramFrame, StreamMode, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Collecting(usize),
    Training,
    Inferring,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Collecting(label) => write!(f, "collecting label {label}"),
            Self::Training => write!(f, "training"),
            Self::Inferring => write!(f, "inferring"),
        }
    }
}

pub struct SessionController<S, M, D> {
    stream: S,
    store: M,
    display: D,

    /// Present exactly while collecting or inferring
    subscription: Option<Subscription>,
    state: SessionState,
    controls: Controls,

    dataset: Dataset,
    classifier: Classifier,
    reporter: ResultReporter,
    topology: Topology,

    stream_config: StreamConfig,
    fit_options: FitOptions,
    threshold: f32,
    local_model: ModelLocation,
    export_model: ModelLocation,
    rng: StdRng,
}

impl<S, M, D> SessionController<S, M, D>
where
    S: FeatureStream,
    M: ModelStore,
    D: DisplaySink,
{
    /// Controller with an untrained classifier. Call [`init`](Self::init) to
    /// pick up a previously saved model.
    pub fn new(config: &Config, stream: S, store: M, display: D) -> Result<Self> {
        config.validate()?;

        let classes = config.session.classes.clone();
        let topology = Topology::for_window(
            config.stream.window_shape(),
            classes.len(),
            config.training.learning_rate,
        )?;
        let local_model: ModelLocation = config.store.local_model.parse()?;
        let export_model: ModelLocation = config.store.export_model.parse()?;

        let mut rng = match config.session.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let classifier = Classifier::build(topology.clone(), Some(rng.gen()))?;

        Ok(Self {
            stream,
            store,
            display,
            subscription: None,
            state: SessionState::Idle,
            controls: Controls::idle(),
            dataset: Dataset::new(),
            classifier,
            reporter: ResultReporter::new(classes),
            topology,
            stream_config: config.stream.clone(),
            fit_options: FitOptions::from(&config.training),
            threshold: config.session.threshold,
            local_model,
            export_model,
            rng,
        })
    }

    /// Load the persisted model, falling back to a fresh build when nothing
    /// usable is stored. Returns whether a stored model was loaded.
    pub fn init(&mut self) -> Result<bool> {
        self.display.status("Loading...");

        let seed = self.next_seed();
        let loaded = match Classifier::load(&self.store, &self.local_model, &self.topology, seed) {
            Ok(classifier) => {
                self.classifier = classifier;
                true
            }
            Err(e) if e.is_load_failure() => {
                warn!(location = %self.local_model, error = %e, "no usable stored model, building a fresh one");
                self.rebuild()?;
                false
            }
            Err(e) => return Err(e.into()),
        };

        self.display.status("Loaded");
        self.set_controls(Controls::idle());
        info!(loaded, classes = self.classes().len(), "session ready");
        Ok(loaded)
    }

    /// Stop any activation, drop every example and start over with a fresh
    /// classifier.
    pub fn reset(&mut self) -> Result<()> {
        self.stop_stream();
        self.dataset.clear();
        self.rebuild()?;
        self.enter_idle();
        self.display.status(&examples_status(0));
        info!("session reset");
        Ok(())
    }

    /// Stop the stream and hand back the collaborators.
    pub fn teardown(mut self) -> (S, M, D) {
        self.stop_stream();
        debug!(examples = self.dataset.len(), "session torn down");
        (self.stream, self.store, self.display)
    }

    /// Begin collecting for `label`, or end collection with `None`.
    ///
    /// If the stream is active for any reason the call only stops it, even
    /// when a different label is requested. Switching labels takes two calls.
    pub fn collect(&mut self, label: Option<usize>) -> Result<()> {
        self.ensure_not_training()?;

        if self.stream_active() {
            self.stop_stream();
            self.enter_idle();
            return Ok(());
        }

        let Some(label) = label else {
            return Ok(());
        };
        if !self.classes().contains(label) {
            return Err(SessionError::InvalidLabel {
                label,
                class_count: self.classes().len(),
            });
        }

        self.start_stream(StreamMode::LabeledCollection)?;
        self.state = SessionState::Collecting(label);
        info!(label, class = self.classes().name(label), "collection started");
        Ok(())
    }

    /// Toggle continuous classification.
    pub fn listen(&mut self) -> Result<()> {
        self.ensure_not_training()?;

        if self.stream_active() {
            self.stop_stream();
            self.enter_idle();
            return Ok(());
        }

        self.start_stream(StreamMode::Classification)?;
        self.state = SessionState::Inferring;
        self.set_controls(Controls::inferring());
        info!("listening");
        Ok(())
    }

    /// Train a fresh classifier on every collected example.
    ///
    /// The current classifier is replaced only if the fit succeeds.
    pub fn train(&mut self) -> Result<FitHistory> {
        if self.state != SessionState::Idle {
            return Err(SessionError::Busy { state: self.state });
        }
        if self.dataset.is_empty() {
            return Err(SessionError::EmptyDataset);
        }

        let tensors = self
            .dataset
            .to_training_tensors(self.topology.input, self.classes().len())?;

        self.state = SessionState::Training;
        self.set_controls(Controls::training());
        info!(examples = tensors.len(), "training started");

        let seed = self.next_seed();
        let display = &mut self.display;
        let result = Classifier::build(self.topology.clone(), seed).and_then(|mut candidate| {
            let history = candidate.fit(&tensors, &self.fit_options, |metrics| {
                display.status(&format!(
                    "Accuracy: {:.1}% Epoch: {}",
                    metrics.accuracy * 100.0,
                    metrics.epoch + 1
                ));
            })?;
            Ok((candidate, history))
        });
        drop(tensors);

        self.enter_idle();

        match result {
            Ok((candidate, history)) => {
                self.classifier = candidate;
                info!(accuracy = history.final_accuracy(), "training finished");
                Ok(history)
            }
            Err(e) => {
                warn!(error = %e, "training failed, keeping the previous model");
                Err(e.into())
            }
        }
    }

    pub fn set_threshold(&mut self, threshold: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SessionError::InvalidThreshold(threshold));
        }
        self.threshold = threshold;
        debug!(threshold, "threshold updated");
        Ok(())
    }

    /// Persist the current model to the local slot.
    pub fn save_model(&mut self) -> Result<()> {
        let location = self.local_model.clone();
        self.save_to(&location)
    }

    /// Write the current model to the export location.
    pub fn export_model(&mut self) -> Result<()> {
        let location = self.export_model.clone();
        self.save_to(&location)
    }

    /// Replace the current classifier with a stored one. On failure the
    /// current classifier stays in place.
    pub fn load_model(&mut self, location: &ModelLocation) -> Result<()> {
        self.ensure_not_training()?;

        let seed = self.next_seed();
        self.classifier = Classifier::load(&self.store, location, &self.topology, seed)?;
        self.display.status("Loaded");
        Ok(())
    }

    /// Handle every frame already queued. Returns how many were handled.
    pub fn process_pending(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let next = match &self.subscription {
                Some(subscription) => subscription.try_next(),
                None => break,
            };
            match next {
                Ok(Some(frame)) => {
                    self.handle_frame(&frame)?;
                    handled += 1;
                }
                Ok(None) => break,
                Err(StreamError::Closed) => {
                    self.stream_closed();
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(handled)
    }

    /// Wait up to `timeout` for one frame and handle it. Returns immediately
    /// with `false` when no activation is outstanding.
    pub fn process_next(&mut self, timeout: Duration) -> Result<bool> {
        let next = match &self.subscription {
            Some(subscription) => subscription.next_timeout(timeout),
            None => return Ok(false),
        };
        match next {
            Ok(Some(frame)) => {
                self.handle_frame(&frame)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(StreamError::Closed) => {
                self.stream_closed();
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn classes(&self) -> &ClassList {
        self.reporter.classes()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn store(&self) -> &M {
        &self.store
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    fn handle_frame(&mut self, frame: &SpectrogramFrame) -> Result<()> {
        let StreamConfig { frames, bins, .. } = self.stream_config;

        match self.state {
            SessionState::Collecting(label) => {
                let features = prepare_window(frame, frames, bins)?;
                self.dataset.append(Example::new(features, label));
                self.display.status(&examples_status(self.dataset.len()));
            }
            SessionState::Inferring => {
                let window = prepare_window(frame, frames, bins)?;
                let probabilities = self.classifier.predict(&window)?;
                let report = self.reporter.report(&probabilities, self.threshold);
                debug!(winner = ?report.winner, "frame classified");
                self.display.result(&report);
            }
            SessionState::Idle | SessionState::Training => {
                debug!(state = %self.state, "frame outside an activation ignored");
            }
        }
        Ok(())
    }

    fn save_to(&mut self, location: &ModelLocation) -> Result<()> {
        self.classifier.save(&mut self.store, location)?;
        self.display.status(&format!("Model saved to {location}"));
        Ok(())
    }

    fn start_stream(&mut self, mode: StreamMode) -> Result<()> {
        let options = self.stream_config.listen_options(mode);
        let subscription = self.stream.start(mode, &options)?;
        debug!(?mode, "stream started");
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Queued frames are discarded with the subscription.
    fn stop_stream(&mut self) {
        if self.subscription.take().is_some() || self.stream.is_active() {
            self.stream.stop();
            debug!(state = %self.state, "stream stopped");
        }
    }

    fn stream_closed(&mut self) {
        warn!(state = %self.state, "feature stream closed");
        self.stop_stream();
        self.enter_idle();
    }

    fn stream_active(&self) -> bool {
        self.subscription.is_some() || self.stream.is_active()
    }

    fn ensure_not_training(&self) -> Result<()> {
        match self.state {
            SessionState::Training => Err(SessionError::Busy { state: self.state }),
            _ => Ok(()),
        }
    }

    fn enter_idle(&mut self) {
        self.state = SessionState::Idle;
        self.set_controls(Controls::idle());
    }

    fn set_controls(&mut self, controls: Controls) {
        self.display.controls(&controls);
        self.controls = controls;
    }

    fn rebuild(&mut self) -> Result<()> {
        let seed = self.next_seed();
        self.classifier = Classifier::build(self.topology.clone(), seed)?;
        Ok(())
    }

    fn next_seed(&mut self) -> Option<u64> {
        Some(self.rng.gen())
    }
}

fn examples_status(count: usize) -> String {
    format!("{count} examples collected")
}
