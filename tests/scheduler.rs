use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gifforge::encode::{EncodeSpec, Encoder};
use gifforge::progress::ProgressTracker;
use gifforge::synth::Frame;
use gifforge::{
    ConvertError, ConvertResult, Format, Inputs, JobId, JobRegistry, Mode, Pan, Params, Pipeline,
    Scheduler, State,
};

#[derive(Default)]
struct CountingEncoder {
    frames: Mutex<Vec<usize>>,
}

impl Encoder for CountingEncoder {
    fn encode(
        &self,
        _spec: &EncodeSpec,
        frames: &mut dyn Iterator<Item = &Frame>,
        progress: &mut ProgressTracker<'_>,
    ) -> ConvertResult<Vec<u8>> {
        let mut count = 0;
        for _ in frames {
            count += 1;
            progress.tick();
        }
        self.frames.lock().unwrap().push(count);
        Ok(b"GIF89a".to_vec())
    }
}

fn png_inputs(count: usize, w: u32, h: u32) -> Inputs {
    let mut inputs = Inputs::new().unwrap();
    for i in 0..count {
        let image = image::RgbaImage::from_pixel(w, h, image::Rgba([i as u8 * 40, 90, 200, 255]));
        image
            .save_with_format(inputs.next_path(), image::ImageFormat::Png)
            .unwrap();
    }
    inputs
}

fn wait_for_terminal(scheduler: &Scheduler, id: JobId) -> State {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let status = scheduler.registry().status(id).unwrap();
        if status.state == State::Done || status.state == State::Error {
            return status.state;
        }
        assert!(Instant::now() < deadline, "job {id} never finished");
        thread::sleep(Duration::from_millis(10));
    }
}

fn scheduler(encoder: Arc<CountingEncoder>, workers: usize, queue: usize) -> Scheduler {
    let pipeline = Arc::new(Pipeline::new(encoder, Duration::from_millis(1)));
    Scheduler::new(Arc::new(JobRegistry::new()), pipeline, workers, queue).unwrap()
}

#[test]
fn single_image_job_runs_to_completion() {
    let encoder = Arc::new(CountingEncoder::default());
    let scheduler = scheduler(encoder.clone(), 1, 2);

    let params = Params {
        mode: Mode::Single,
        fps: 15,
        duration: 3.0,
        zoom: 1.12,
        pan: Pan::Diagonal,
        ..Params::default()
    };
    let id = scheduler.submit(params, png_inputs(1, 320, 240)).unwrap();

    assert_eq!(wait_for_terminal(&scheduler, id), State::Done);
    assert_eq!(*encoder.frames.lock().unwrap(), vec![45]);

    let status = scheduler.registry().status(id).unwrap();
    assert_eq!(status.progress, 100.0);
    assert_eq!(status.eta, None);
    assert!(status.started_at.is_some());
    assert_eq!(scheduler.registry().status(id).unwrap(), status);

    let output = scheduler.registry().output(id).unwrap();
    assert_eq!(output.format, Format::Gif);
    assert_eq!(output.bytes, b"GIF89a");
}

#[test]
fn image_sequence_with_bounce_is_palindromic_length() {
    let encoder = Arc::new(CountingEncoder::default());
    let scheduler = scheduler(encoder.clone(), 2, 2);

    let params = Params {
        mode: Mode::Images,
        fps: 10,
        bounce: true,
        ..Params::default()
    };
    let id = scheduler.submit(params, png_inputs(5, 64, 48)).unwrap();

    assert_eq!(wait_for_terminal(&scheduler, id), State::Done);
    assert_eq!(*encoder.frames.lock().unwrap(), vec![8]);
}

#[test]
fn many_jobs_all_finish_and_release_capacity() {
    let encoder = Arc::new(CountingEncoder::default());
    let scheduler = scheduler(encoder.clone(), 2, 6);

    let ids: Vec<JobId> = (0..8)
        .map(|_| {
            let params = Params {
                mode: Mode::Images,
                fps: 5,
                ..Params::default()
            };
            scheduler.submit(params, png_inputs(2, 32, 32)).unwrap()
        })
        .collect();

    for id in &ids {
        assert_eq!(wait_for_terminal(&scheduler, *id), State::Done);
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.in_flight() > 0 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(scheduler.registry().list().len(), 8);
}

#[test]
fn wrong_input_count_is_rejected_up_front() {
    let scheduler = scheduler(Arc::new(CountingEncoder::default()), 1, 1);
    let params = Params {
        mode: Mode::Single,
        ..Params::default()
    };
    let err = scheduler.submit(params, png_inputs(2, 8, 8)).unwrap_err();
    assert!(matches!(err, ConvertError::Validation(_)));
    assert!(scheduler.registry().is_empty());
    assert_eq!(scheduler.in_flight(), 0);
}
