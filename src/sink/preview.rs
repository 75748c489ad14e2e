//! SDL2 Preview Window
//! Shows the newest packaged frame in a local window. The window runs on its
//! own thread and is fed through a single-slot channel, so a slow display
//! never holds up the publish tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use flume::{Receiver, Sender};
use sdl2::event::Event;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::Canvas;
use sdl2::video::Window;
use tracing::{error, info};

use crate::capture::{PackagedFrame, TargetEncoding};
use crate::error::SinkError;
use crate::sink::FrameSink;

const EVENT_POLL: Duration = Duration::from_millis(16);

pub struct PreviewSink {
    tx: Option<Sender<PackagedFrame>>,
    // Kept to evict a stale frame when the slot is taken
    rx: Receiver<PackagedFrame>,
    handle: Option<JoinHandle<()>>,
    // Set by the window thread when it exits, for any reason
    window_closed: Arc<AtomicBool>,
    disabled: bool,
}

impl PreviewSink {
    pub fn spawn(title: &str, width: u32, height: u32) -> Result<Self, SinkError> {
        let title = title.to_string();
        Self::spawn_with(move |rx| run_window(&title, width, height, rx))
    }

    fn spawn_with<F>(window: F) -> Result<Self, SinkError>
    where
        F: FnOnce(Receiver<PackagedFrame>) -> Result<(), String> + Send + 'static,
    {
        let (tx, rx) = flume::bounded::<PackagedFrame>(1);
        let thread_rx = rx.clone();
        let window_closed = Arc::new(AtomicBool::new(false));
        let closed = window_closed.clone();

        let handle = std::thread::Builder::new()
            .name("relay-preview".into())
            .spawn(move || {
                if let Err(e) = window(thread_rx) {
                    error!(stage = "preview", error = %e, "Preview window failed");
                }
                closed.store(true, Ordering::Release);
            })
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        Ok(Self {
            tx: Some(tx),
            rx,
            handle: Some(handle),
            window_closed,
            disabled: false,
        })
    }
}

impl FrameSink for PreviewSink {
    fn name(&self) -> &str {
        "preview"
    }

    fn send(&mut self, frame: PackagedFrame, _sent_at: SystemTime) -> Result<(), SinkError> {
        let Some(tx) = &self.tx else {
            return Err(SinkError::Closed("preview".into()));
        };
        if self.disabled {
            return Ok(());
        }
        if self.window_closed.load(Ordering::Acquire) {
            info!("Preview window closed, preview disabled");
            self.disabled = true;
            while self.rx.try_recv().is_ok() {}
            return Ok(());
        }
        let _ = self.rx.try_recv();
        // Full if the window thread raced us for the slot; a gone window is
        // seen through `window_closed` on the next send.
        let _ = tx.try_send(frame);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        // Dropping the sender ends the window loop
        self.tx = None;
        while self.rx.try_recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| SinkError::Transport("preview thread panicked".into()))?;
        }
        Ok(())
    }
}

fn run_window(
    title: &str,
    width: u32,
    height: u32,
    rx: Receiver<PackagedFrame>,
) -> Result<(), String> {
    let sdl_context = sdl2::init()?;
    let video_subsystem = sdl_context.video()?;
    let window = video_subsystem
        .window(title, width, height)
        .position_centered()
        .resizable()
        .build()
        .map_err(|e| e.to_string())?;
    let mut canvas = window
        .into_canvas()
        .present_vsync()
        .build()
        .map_err(|e| e.to_string())?;
    let mut event_pump = sdl_context.event_pump()?;

    'running: loop {
        for event in event_pump.poll_iter() {
            if let Event::Quit { .. } = event {
                info!("Quit event received");
                break 'running;
            }
        }

        match rx.recv_timeout(EVENT_POLL) {
            Ok(frame) => render_frame(&mut canvas, &frame)?,
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

fn render_frame(canvas: &mut Canvas<Window>, frame: &PackagedFrame) -> Result<(), String> {
    let (w, h) = (frame.width, frame.height);
    if frame.data.len() < frame.encoding.frame_len(w, h) {
        return Err(format!("short {} frame {}x{}", frame.encoding, w, h));
    }
    let texture_creator = canvas.texture_creator();

    let format = match frame.encoding {
        TargetEncoding::I420 => PixelFormatEnum::IYUV,
        TargetEncoding::Rgb8 => PixelFormatEnum::RGB24,
        TargetEncoding::Bgr8 => PixelFormatEnum::BGR24,
        // R,G,B,A byte order on little endian
        TargetEncoding::Rgba8 => PixelFormatEnum::ABGR8888,
    };
    let mut texture = texture_creator
        .create_texture_streaming(format, w, h)
        .map_err(|e| e.to_string())?;

    if frame.encoding == TargetEncoding::I420 {
        let (w, h) = (w as usize, h as usize);
        let cw = w.div_ceil(2);
        let plane = cw * h.div_ceil(2);
        let (y, chroma) = frame.data.split_at(w * h);
        let (u, v) = chroma.split_at(plane);
        texture
            .update_yuv(None, y, w, u, cw, &v[..plane], cw)
            .map_err(|e| e.to_string())?;
    } else {
        texture
            .update(None, &frame.data, frame.stride as usize)
            .map_err(|e| e.to_string())?;
    }

    canvas.clear();
    canvas.copy(&texture, None, None)?;
    canvas.present();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::sink::testing::packaged;

    fn wait_closed(sink: &PreviewSink) {
        let started = Instant::now();
        while !sink.window_closed.load(Ordering::Acquire) {
            assert!(started.elapsed() < Duration::from_secs(2), "window thread never exited");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn frames_stop_once_the_window_exits() {
        let mut sink = PreviewSink::spawn_with(|_rx| Ok(())).unwrap();
        wait_closed(&sink);

        sink.send(packaged(1), SystemTime::now()).unwrap();
        assert!(sink.disabled);
        assert!(sink.rx.is_empty());
        sink.send(packaged(2), SystemTime::now()).unwrap();
        assert!(sink.rx.is_empty());
        sink.close().unwrap();
    }

    #[test]
    fn failed_window_also_disables_preview() {
        let mut sink = PreviewSink::spawn_with(|_rx| Err("no display".into())).unwrap();
        wait_closed(&sink);
        sink.send(packaged(1), SystemTime::now()).unwrap();
        assert!(sink.disabled);
    }

    #[test]
    fn live_window_keeps_only_the_newest_frame() {
        // Window that never reads, so the slot stays ours
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let mut sink = PreviewSink::spawn_with(move |_rx| {
            let _ = release_rx.recv();
            Ok(())
        })
        .unwrap();

        sink.send(packaged(1), SystemTime::now()).unwrap();
        sink.send(packaged(2), SystemTime::now()).unwrap();
        assert_eq!(sink.rx.len(), 1);
        assert_eq!(sink.rx.try_recv().unwrap().sequence, 2);

        release_tx.send(()).unwrap();
        sink.close().unwrap();
    }
}
