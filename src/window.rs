use ash::vk;
use smallvec::SmallVec;
use tracing::debug;

use crate::{camera::CameraInput, config::RuntimeConfiguration};

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum WindowEvent {
    CloseRequested,
    Resized(vk::Extent2D),
    ReloadShaders,
    Input(CameraInput),
}

pub(crate) type WindowEvents = SmallVec<[WindowEvent; 4]>;

/// The surface the frame loop presents to and takes input from.
pub(crate) trait Window {
    /// Events since the previous call, polled once per iteration.
    fn poll_events(&mut self) -> WindowEvents;
    fn set_title(&mut self, title: &str);
}

/// Replays scripted events instead of talking to a windowing system.
pub(crate) struct HeadlessWindow {
    frame: u64,
    frame_limit: u64,
    resize_schedule: Vec<(u64, vk::Extent2D)>,
    reload_schedule: Vec<u64>,
    input: CameraInput,
    title: String,
}

impl HeadlessWindow {
    pub(crate) fn new(config: &RuntimeConfiguration) -> HeadlessWindow {
        HeadlessWindow {
            frame: 0,
            frame_limit: config.frames,
            resize_schedule: config.resize_schedule.clone(),
            reload_schedule: config.reload_schedule.clone(),
            input: CameraInput::default(),
            title: String::new(),
        }
    }
}

#[cfg(test)]
impl HeadlessWindow {
    /// Input reported on every frame.
    pub(crate) fn with_input(mut self, input: CameraInput) -> HeadlessWindow {
        self.input = input;
        self
    }

    pub(crate) fn title(&self) -> &str {
        &self.title
    }
}

impl Window for HeadlessWindow {
    fn poll_events(&mut self) -> WindowEvents {
        let frame = self.frame;
        self.frame += 1;

        let mut events = WindowEvents::new();
        if frame >= self.frame_limit {
            events.push(WindowEvent::CloseRequested);
            return events;
        }
        events.extend(
            self.resize_schedule
                .iter()
                .filter(|(at, _)| *at == frame)
                .map(|&(_, extent)| WindowEvent::Resized(extent)),
        );
        if self.reload_schedule.contains(&frame) {
            events.push(WindowEvent::ReloadShaders);
        }
        if self.input != CameraInput::default() {
            events.push(WindowEvent::Input(self.input));
        }
        events
    }

    fn set_title(&mut self, title: &str) {
        if self.title != title {
            debug!(title, "window title");
            self.title = title.to_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_the_schedule_and_closes() {
        let small = vk::Extent2D { width: 8, height: 8 };
        let mut window = HeadlessWindow::new(&RuntimeConfiguration {
            frames: 3,
            resize_schedule: vec![(1, small)],
            reload_schedule: vec![2],
            ..Default::default()
        });

        assert!(window.poll_events().is_empty());
        assert_eq!(window.poll_events().as_slice(), &[WindowEvent::Resized(small)]);
        assert_eq!(window.poll_events().as_slice(), &[WindowEvent::ReloadShaders]);
        assert_eq!(window.poll_events().as_slice(), &[WindowEvent::CloseRequested]);

        window.set_title("restir");
        assert_eq!(window.title(), "restir");
    }
}
