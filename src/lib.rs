//! Shared core of an interactive algae object-detection session.
//!
//! The core owns the session state (current image, confidence threshold,
//! caption) and drives the display through the render capability. Shells feed
//! user input in as [`Event`]s and draw from the [`ViewModel`]; everything
//! that touches the outside world goes through capabilities, so the core runs
//! identically on every platform and inside tests.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod annotate;
pub mod capabilities;
pub mod image_source;
pub mod vision;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::vision::{DetectError, Detector};

pub use app::App;
pub use capabilities::{Capabilities, Effect};

/// Image shown before the user uploads anything.
pub const DEFAULT_IMAGE_URL: &str =
    "https://raw.githubusercontent.com/roman-dusek/algae_detection/main/test_images/tabellaria_3.jpg";

/// Caption shown before the first prediction.
pub const INITIAL_CAPTION: &str = "Initial Image";

/// Confidence the detector is configured with until the user picks one.
pub const INITIAL_CONFIDENCE: f32 = 0.65;

/// The fixed threshold choices offered by the selector.
pub const THRESHOLD_CHOICES: [f32; 5] = [0.1, 0.25, 0.5, 0.75, 0.95];

/// Selector position shown by default (0.5).
pub const DEFAULT_THRESHOLD_INDEX: usize = 2;

/// Everything that can go wrong at the session level.
///
/// `Fetch` is fatal: with no default image and nothing uploaded yet there is
/// nothing to recover to. Everything else leaves the previous display intact.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("failed to load the default image: {0}")]
    Fetch(String),

    #[error(transparent)]
    Decode(#[from] image_source::DecodeError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error("no image available to run detection on")]
    NoImage,
}

impl SessionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Decode(_) => "decode",
            Self::Detect(_) => "detect",
            Self::NoImage => "no_image",
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }

    /// Message safe to show in the UI. Internal detail stays in the logs.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self {
            Self::Fetch(_) => "The default image could not be loaded.".into(),
            Self::Decode(_) => "That image could not be read. Please upload a JPEG, PNG or WebP.".into(),
            Self::Detect(DetectError::ModelNotReady) => {
                "The detection model is not loaded yet.".into()
            }
            Self::Detect(_) => "Detection failed. The previous image is still shown.".into(),
            Self::NoImage => "Upload or load an image before running detection.".into(),
        }
    }
}

/// Where the session is in its lifecycle. `Failed` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    AwaitingImage,
    ImageDisplayed,
    Predicting,
    ResultDisplayed,
    Failed,
}

pub struct Model {
    pub state: SessionState,
    detector: Option<Box<dyn Detector>>,
    current_image: Option<RgbImage>,
    caption: String,
    threshold: f32,
    active_error: Option<SessionError>,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            state: SessionState::default(),
            detector: None,
            current_image: None,
            caption: String::new(),
            threshold: INITIAL_CONFIDENCE,
            active_error: None,
        }
    }
}

impl Model {
    /// Installs the detection capability. The bootstrap shell loads the model
    /// weights and calls this before sending [`Event::Started`]; predicting
    /// without a detector surfaces [`DetectError::ModelNotReady`].
    pub fn install_detector(&mut self, detector: Box<dyn Detector>) {
        self.detector = Some(detector);
    }

    fn set_error(&mut self, error: SessionError) {
        warn!(code = error.code(), error = %error, "session error");
        self.active_error = Some(error);
    }

    fn fail(&mut self, error: SessionError) {
        self.state = SessionState::Failed;
        self.set_error(error);
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Event {
    /// Sent once by the shell after bootstrap.
    Started,

    #[serde(skip)]
    DefaultImageFetched(Box<crux_http::Result<crux_http::Response<Vec<u8>>>>),

    /// Raw encoded bytes of a user-chosen replacement image.
    ImageUploaded {
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },

    /// Index into [`THRESHOLD_CHOICES`].
    ThresholdSelected { index: usize },

    PredictRequested,

    DismissError,
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::DefaultImageFetched(_) => "default_image_fetched",
            Self::ImageUploaded { .. } => "image_uploaded",
            Self::ThresholdSelected { .. } => "threshold_selected",
            Self::PredictRequested => "predict_requested",
            Self::DismissError => "dismiss_error",
        }
    }
}

/// Pixel matrix handed to the display surface, canonical RGB row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageView {
    pub width: u32,
    pub height: u32,
    #[serde(with = "serde_bytes")]
    pub rgb: Vec<u8>,
}

impl ImageView {
    fn from_image(image: &RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            rgb: image.as_raw().clone(),
        }
    }
}

/// One row of the class listing shown alongside the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub id: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ViewState {
    Loading,
    Ready {
        image: ImageView,
        caption: String,
        threshold: f32,
        threshold_choices: Vec<f32>,
        /// Selector position to preselect when no choice has been made yet.
        default_threshold_index: usize,
        classes: Vec<ClassEntry>,
        predicting: bool,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFacingError {
    pub code: String,
    pub message: String,
    pub dismissable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewModel {
    pub state: ViewState,
    pub error: Option<UserFacingError>,
}

pub mod app {
    use std::borrow::Cow;

    use super::{
        annotate, image_source, Capabilities, ClassEntry, Event, ImageView, Model, SessionError,
        SessionState, UserFacingError, ViewModel, ViewState, DEFAULT_IMAGE_URL,
        DEFAULT_THRESHOLD_INDEX, INITIAL_CAPTION, THRESHOLD_CHOICES,
    };
    use crate::vision::DetectError;
    use tracing::{debug, warn};

    #[derive(Default)]
    pub struct App;

    impl crux_core::App for App {
        type Event = Event;
        type Model = Model;
        type ViewModel = ViewModel;
        type Capabilities = Capabilities;

        fn update(&self, event: Self::Event, model: &mut Self::Model, caps: &Self::Capabilities) {
            debug!(event = event.name(), state = ?model.state, "handling event");

            match event {
                Event::Started => {
                    match url::Url::parse(DEFAULT_IMAGE_URL) {
                        Ok(endpoint) => {
                            caps.http.get(endpoint.as_str()).send(|response| {
                                Event::DefaultImageFetched(Box::new(response))
                            });
                        }
                        Err(e) => {
                            model.fail(SessionError::Fetch(format!(
                                "invalid default image URL: {e}"
                            )));
                        }
                    }
                    caps.render.render();
                }

                Event::DefaultImageFetched(response) => {
                    // An upload may have landed before the network did; the
                    // fetched default must not clobber it.
                    if model.current_image.is_some() {
                        debug!("discarding stale default image fetch");
                        return;
                    }
                    Self::apply_fetched_default(*response, model);
                    caps.render.render();
                }

                Event::ImageUploaded { bytes } => {
                    let resolved = image_source::resolve(Some(&bytes), model.current_image.as_ref())
                        .map(|image| image.map(Cow::into_owned));
                    match resolved {
                        Ok(Some(image)) => {
                            // Caption only changes on the next prediction,
                            // except when this upload is the first image.
                            if model.current_image.is_none() {
                                model.caption = INITIAL_CAPTION.to_string();
                            }
                            model.current_image = Some(image);
                            model.state = SessionState::ImageDisplayed;
                            model.active_error = None;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            // Previous image and caption stay on screen.
                            model.set_error(SessionError::Decode(e));
                        }
                    }
                    caps.render.render();
                }

                Event::ThresholdSelected { index } => {
                    if let Some(&value) = THRESHOLD_CHOICES.get(index) {
                        debug!(threshold = value, "threshold selected");
                        model.threshold = value;
                    } else {
                        warn!(index, "threshold index out of range, ignoring");
                    }
                    caps.render.render();
                }

                Event::PredictRequested => {
                    if model.state == SessionState::Predicting {
                        debug!("prediction already in flight, ignoring trigger");
                        return;
                    }
                    Self::run_prediction(model);
                    caps.render.render();
                }

                Event::DismissError => {
                    match &model.active_error {
                        Some(error) if error.is_fatal() => {}
                        _ => model.active_error = None,
                    }
                    caps.render.render();
                }
            }
        }

        fn view(&self, model: &Self::Model) -> Self::ViewModel {
            let error = model.active_error.as_ref().map(|error| UserFacingError {
                code: error.code().to_string(),
                message: error.user_facing_message(),
                dismissable: !error.is_fatal(),
            });

            let state = if model.state == SessionState::Failed {
                ViewState::Failed {
                    message: model
                        .active_error
                        .as_ref()
                        .map_or_else(|| "The session failed to start.".into(), SessionError::user_facing_message),
                }
            } else if let Some(image) = &model.current_image {
                ViewState::Ready {
                    image: ImageView::from_image(image),
                    caption: model.caption.clone(),
                    threshold: model.threshold,
                    threshold_choices: THRESHOLD_CHOICES.to_vec(),
                    default_threshold_index: DEFAULT_THRESHOLD_INDEX,
                    classes: model.detector.as_ref().map_or_else(Vec::new, |detector| {
                        detector
                            .catalog()
                            .iter()
                            .enumerate()
                            .map(|(id, name)| ClassEntry {
                                id,
                                name: name.to_string(),
                            })
                            .collect()
                    }),
                    predicting: model.state == SessionState::Predicting,
                }
            } else {
                ViewState::Loading
            };

            ViewModel { state, error }
        }
    }

    impl App {
        fn apply_fetched_default(
            response: crux_http::Result<crux_http::Response<Vec<u8>>>,
            model: &mut Model,
        ) {
            match response {
                Ok(mut response) if response.status().is_success() => {
                    let body = response.take_body().unwrap_or_default();
                    match image_source::decode_rgb(&body) {
                        Ok(image) => {
                            debug!(
                                width = image.width(),
                                height = image.height(),
                                "default image ready"
                            );
                            model.current_image = Some(image);
                            model.caption = INITIAL_CAPTION.to_string();
                            model.state = SessionState::ImageDisplayed;
                        }
                        Err(e) => {
                            // Nothing to fall back to this early in the
                            // session, so the decode failure is terminal.
                            model.fail(SessionError::Fetch(format!(
                                "default image could not be decoded: {e}"
                            )));
                        }
                    }
                }
                Ok(response) => {
                    model.fail(SessionError::Fetch(format!(
                        "default image fetch returned {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    model.fail(SessionError::Fetch(e.to_string()));
                }
            }
        }

        /// Single-shot prediction over the current image at the currently
        /// selected threshold. Any failure leaves the display untouched.
        fn run_prediction(model: &mut Model) {
            let Model {
                state,
                detector,
                current_image,
                caption,
                threshold,
                active_error,
            } = &mut *model;

            let Some(detector) = detector.as_mut() else {
                warn!("predict requested with no detector installed");
                *active_error = Some(SessionError::Detect(DetectError::ModelNotReady));
                return;
            };
            let Some(image) = current_image.as_ref() else {
                *active_error = Some(SessionError::NoImage);
                return;
            };

            *state = SessionState::Predicting;
            detector.configure_threshold(*threshold);

            match detector.infer(image) {
                Ok(inference) => {
                    let rendered = annotate::render(&inference.detections, inference.annotated);
                    *current_image = Some(rendered.display);
                    *caption = rendered.caption;
                    *state = SessionState::ResultDisplayed;
                    *active_error = None;
                }
                Err(e) => {
                    *state = SessionState::ImageDisplayed;
                    let error = SessionError::Detect(e);
                    warn!(code = error.code(), error = %error, "prediction failed");
                    *active_error = Some(error);
                }
            }
        }
    }
}
