use std::{
    path::Path,
    sync::mpsc::{channel, Receiver, TryRecvError},
    time::Duration,
};

use notify::{watcher, DebouncedEvent, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

/// Watches the shader directory and reports when any source changed.
pub(crate) struct ShaderReload {
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
    rx: Receiver<DebouncedEvent>,
}

impl ShaderReload {
    pub(crate) fn new(shader_dir: &Path) -> notify::Result<ShaderReload> {
        let (tx, rx) = channel();
        let mut watcher = watcher(tx, Duration::from_millis(100))?;
        watcher.watch(shader_dir, RecursiveMode::NonRecursive)?;

        Ok(ShaderReload { watcher, rx })
    }

    /// Drains pending events, returns whether a reload is due.
    pub(crate) fn poll(&self) -> bool {
        let mut dirty = false;
        loop {
            match self.rx.try_recv() {
                Ok(DebouncedEvent::Write(path)) | Ok(DebouncedEvent::Create(path)) => {
                    debug!(path = %path.display(), "shader source changed");
                    dirty = true;
                }
                Ok(DebouncedEvent::Error(err, path)) => warn!(%err, ?path, "shader watcher error"),
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("shader watcher disconnected");
                    break;
                }
            }
        }
        dirty
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, thread, time::Instant};

    use super::*;

    #[test]
    fn reports_written_sources() {
        let dir = std::env::temp_dir().join(format!("restir-shader-reload-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let reload = ShaderReload::new(&dir).unwrap();
        assert!(!reload.poll());

        fs::write(dir.join("direct_light.hlsl"), "// edited").unwrap();
        // events arrive after the debounce delay
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut dirty = false;
        while !dirty && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
            dirty = reload.poll();
        }
        assert!(dirty);

        drop(reload);
        fs::remove_dir_all(dir).unwrap();
    }
}
