use algascope::vision::{DetectError, Detection, StubDetector};
use algascope::{
    image_source, App, Effect, Event, Model, SessionState, ViewState, DEFAULT_THRESHOLD_INDEX,
    INITIAL_CAPTION, THRESHOLD_CHOICES,
};
use crux_core::testing::AppTester;
use crux_http::testing::ResponseBuilder;
use image::{Rgb, RgbImage};
use proptest::prelude::*;

fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([40, 90, 130]));
    image_source::encode_png(&image).unwrap()
}

fn detection(name: &str, bbox: [f32; 4], score: f32) -> Detection {
    Detection {
        class_name: name.to_string(),
        bbox,
        score,
    }
}

#[test]
fn full_prediction_flow() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let stub = StubDetector::returning(vec![
        detection("diatom", [10.0, 10.0, 120.0, 120.0], 0.91),
        detection("diatom", [300.0, 200.0, 420.0, 330.0], 0.40),
    ]);
    let threshold_log = stub.threshold_log();
    model.install_detector(Box::new(stub));

    // 1. Started kicks off the default image fetch
    let update = app.update(Event::Started, &mut model);
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Http(_))));
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Render(_))));
    assert_eq!(model.state, SessionState::AwaitingImage);

    // 2. Default image arrives
    let response = ResponseBuilder::ok().body(sample_png(640, 480)).build();
    let update = app.update(
        Event::DefaultImageFetched(Box::new(Ok(response))),
        &mut model,
    );
    assert_eq!(model.state, SessionState::ImageDisplayed);
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Render(_))));
    match app.view(&model).state {
        ViewState::Ready { caption, image, .. } => {
            assert_eq!(caption, INITIAL_CAPTION);
            assert_eq!((image.width, image.height), (640, 480));
        }
        other => panic!("expected Ready, got {other:?}"),
    }

    // 3. Pick threshold 0.75
    app.update(Event::ThresholdSelected { index: 3 }, &mut model);

    // 4. Run detection
    let update = app.update(Event::PredictRequested, &mut model);
    assert_eq!(model.state, SessionState::ResultDisplayed);
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Render(_))));
    assert_eq!(*threshold_log.lock().unwrap(), vec![0.75]);

    match app.view(&model).state {
        ViewState::Ready {
            caption,
            image,
            predicting,
            ..
        } => {
            assert_eq!(
                caption,
                "DETECTED: name=diatom confidence=91.0%, name=diatom confidence=40.0%, "
            );
            // The annotated image replaces the original but keeps its size
            assert_eq!((image.width, image.height), (640, 480));
            assert!(!predicting);
        }
        other => panic!("expected Ready, got {other:?}"),
    }

    // 5. A second run at a different threshold goes through again
    app.update(Event::ThresholdSelected { index: 0 }, &mut model);
    app.update(Event::PredictRequested, &mut model);
    assert_eq!(model.state, SessionState::ResultDisplayed);
    assert_eq!(*threshold_log.lock().unwrap(), vec![0.75, 0.1]);
}

#[test]
fn failed_inference_keeps_previous_result_on_screen() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    model.install_detector(Box::new(StubDetector::failing(DetectError::Inference(
        "scripted".into(),
    ))));

    let response = ResponseBuilder::ok().body(sample_png(320, 240)).build();
    app.update(
        Event::DefaultImageFetched(Box::new(Ok(response))),
        &mut model,
    );

    app.update(Event::PredictRequested, &mut model);

    assert_eq!(model.state, SessionState::ImageDisplayed);
    let view = app.view(&model);
    match view.state {
        ViewState::Ready { caption, image, .. } => {
            assert_eq!(caption, INITIAL_CAPTION);
            assert_eq!((image.width, image.height), (320, 240));
        }
        other => panic!("expected Ready, got {other:?}"),
    }
    let error = view.error.expect("inference failure should be surfaced");
    assert_eq!(error.code, "detect");
    assert!(error.dismissable);
}

#[test]
fn selector_offers_the_fixed_threshold_set() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let response = ResponseBuilder::ok().body(sample_png(32, 32)).build();
    app.update(
        Event::DefaultImageFetched(Box::new(Ok(response))),
        &mut model,
    );

    match app.view(&model).state {
        ViewState::Ready {
            threshold_choices,
            default_threshold_index,
            ..
        } => {
            assert_eq!(threshold_choices, THRESHOLD_CHOICES.to_vec());
            assert_eq!(default_threshold_index, DEFAULT_THRESHOLD_INDEX);
            assert_eq!(threshold_choices[default_threshold_index], 0.5);
        }
        other => panic!("expected Ready, got {other:?}"),
    }
}

proptest! {
    /// Whatever the detector reports, the caption starts with the fixed
    /// prefix and carries exactly one name fragment per detection.
    #[test]
    fn caption_shape_matches_detection_count(
        scores in prop::collection::vec(0.01f32..1.0, 0..8)
    ) {
        let detections: Vec<Detection> = scores
            .iter()
            .map(|&score| detection("volvox", [5.0, 5.0, 25.0, 25.0], score))
            .collect();

        let caption = algascope::annotate::build_caption(&detections);

        prop_assert!(caption.starts_with("DETECTED:"));
        prop_assert_eq!(caption.matches(" name=").count(), detections.len());
        prop_assert_eq!(caption.matches('%').count(), detections.len());
    }
}
