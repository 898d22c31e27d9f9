use std::{ffi::OsString, path::PathBuf};

use ash::vk;
use clap::{error::ErrorKind, ArgAction, CommandFactory, Parser};
use thiserror::Error;

use crate::renderer::flight_ring::MAX_FLIGHTS;

#[derive(Error, Debug, PartialEq)]
pub(crate) enum ConfigError {
    #[error("{what}: {reason}")]
    OutOfRange { what: &'static str, reason: String },
}

fn parse_extent(value: &str) -> Result<vk::Extent2D, String> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, found {:?}", value))?;
    let dimension = |text: &str| {
        text.parse::<u32>()
            .map_err(|err| format!("{:?} is not a dimension: {}", text, err))
    };
    Ok(vk::Extent2D {
        width: dimension(width)?,
        height: dimension(height)?,
    })
}

fn parse_resize(value: &str) -> Result<(u64, vk::Extent2D), String> {
    let (frame, extent) = value
        .split_once(':')
        .ok_or_else(|| format!("expected FRAME:WIDTHxHEIGHT, found {:?}", value))?;
    let frame = frame
        .parse()
        .map_err(|err| format!("{:?} is not a frame number: {}", frame, err))?;
    Ok((frame, parse_extent(extent)?))
}

fn parse_rgb(value: &str) -> Result<[f32; 3], String> {
    let channels = value
        .split(',')
        .map(|channel| channel.trim().parse::<f32>().map_err(|err| format!("{:?}: {}", channel, err)))
        .collect::<Result<Vec<_>, _>>()?;
    match channels[..] {
        [r, g, b] => Ok([r, g, b]),
        _ => Err(format!("expected R,G,B, found {} channels", channels.len())),
    }
}

/// Knobs of the renderer and the headless frame loop.
#[derive(Parser, Clone, Debug, PartialEq)]
#[command(name = "restir", version, about = "Headless ReSTIR direct lighting renderer")]
pub(crate) struct RuntimeConfiguration {
    /// Frames in flight
    #[arg(long, default_value_t = 2)]
    pub(crate) flights: u32,
    /// Reservoir buffers, at least 2 and dividing the flight count
    #[arg(long = "reservoirs", default_value_t = 2)]
    pub(crate) reservoir_slots: u32,
    /// Capacity of the bindless texture and buffer arrays
    #[arg(long = "bindless", default_value_t = 16)]
    pub(crate) bindless_capacity: u32,
    /// Output resolution, WIDTHxHEIGHT
    #[arg(long = "size", value_parser = parse_extent, default_value = "640x360")]
    pub(crate) extent: vk::Extent2D,
    /// Frames to render before closing
    #[arg(long, default_value_t = 120)]
    pub(crate) frames: u64,
    /// Initial light candidates per pixel
    #[arg(long = "candidates", default_value_t = 8)]
    pub(crate) initial_candidates: u32,
    /// Sample count cap of the temporal history
    #[arg(long, default_value_t = 20)]
    pub(crate) history_cap: u32,
    /// Disable temporal reservoir reuse
    #[arg(long = "no-temporal", action = ArgAction::SetFalse)]
    pub(crate) temporal_reuse: bool,
    /// Radiance of missed rays and constant term of every surface, R,G,B
    #[arg(long, value_parser = parse_rgb, default_value = "0.02,0.02,0.025")]
    pub(crate) ambient: [f32; 3],
    /// Shader source directory
    #[arg(long = "shaders", default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders"))]
    pub(crate) shader_dir: PathBuf,
    /// Write the last presented frame to this PNG file
    #[arg(long)]
    pub(crate) capture: Option<PathBuf>,
    /// Resize the window at a frame, FRAME:WIDTHxHEIGHT, repeatable
    #[arg(long = "resize-at", value_parser = parse_resize)]
    pub(crate) resize_schedule: Vec<(u64, vk::Extent2D)>,
    /// Reload the shaders at a frame, repeatable
    #[arg(long = "reload-at")]
    pub(crate) reload_schedule: Vec<u64>,
}

impl Default for RuntimeConfiguration {
    fn default() -> RuntimeConfiguration {
        RuntimeConfiguration::parse_from(["restir"])
    }
}

impl RuntimeConfiguration {
    /// Parses the command line, program name included, and checks the flags against each other.
    pub(crate) fn try_from_args<I, T>(args: I) -> Result<RuntimeConfiguration, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = RuntimeConfiguration::try_parse_from(args)?;
        config
            .validate()
            .map_err(|err| RuntimeConfiguration::command().error(ErrorKind::ValueValidation, err))?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let out_of_range = |what: &'static str, reason: String| Err(ConfigError::OutOfRange { what, reason });

        if self.flights == 0 || self.flights > MAX_FLIGHTS {
            return out_of_range("flights", format!("{} is outside of 1..={}", self.flights, MAX_FLIGHTS));
        }
        if self.reservoir_slots < 2 || self.flights % self.reservoir_slots != 0 {
            return out_of_range(
                "reservoirs",
                format!(
                    "{} buffers cannot be exchanged between {} flights",
                    self.reservoir_slots, self.flights
                ),
            );
        }
        if self.bindless_capacity == 0 {
            return out_of_range("bindless", "capacity must not be zero".to_owned());
        }
        for extent in std::iter::once(&self.extent).chain(self.resize_schedule.iter().map(|(_, extent)| extent)) {
            if extent.width == 0 || extent.height == 0 {
                return out_of_range("size", format!("{}x{} is empty", extent.width, extent.height));
            }
        }
        if self.initial_candidates == 0 {
            return out_of_range("candidates", "at least one candidate is needed".to_owned());
        }
        if self.history_cap == 0 {
            return out_of_range("history-cap", "must not be zero".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<RuntimeConfiguration, clap::Error> {
        RuntimeConfiguration::try_from_args(std::iter::once("restir").chain(line.split_whitespace()))
    }

    #[test]
    fn defaults_are_valid() {
        RuntimeConfiguration::command().debug_assert();
        let config = RuntimeConfiguration::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(parse("").unwrap(), config);
        assert_eq!(config.extent, vk::Extent2D { width: 640, height: 360 });
        assert_eq!((config.initial_candidates, config.history_cap), (8, 20));
        assert_eq!(config.ambient, [0.02, 0.02, 0.025]);
        assert!(config.temporal_reuse);
    }

    #[test]
    fn parses_every_flag() {
        let config = parse(
            "--flights 4 --reservoirs 2 --bindless 8 --size 320x200 --frames 10 --candidates 2 \
             --history-cap 5 --ambient 0.1,0.2,0.3 --shaders /tmp/shaders --capture out.png \
             --resize-at 3:160x100 --resize-at 6:320x200 --reload-at 4 --no-temporal",
        )
        .unwrap();

        assert_eq!((config.flights, config.reservoir_slots, config.bindless_capacity), (4, 2, 8));
        assert_eq!(config.extent, vk::Extent2D { width: 320, height: 200 });
        assert_eq!((config.frames, config.initial_candidates, config.history_cap), (10, 2, 5));
        assert_eq!(config.ambient, [0.1, 0.2, 0.3]);
        assert_eq!(config.shader_dir, PathBuf::from("/tmp/shaders"));
        assert_eq!(config.capture, Some(PathBuf::from("out.png")));
        assert_eq!(
            config.resize_schedule,
            vec![
                (3, vk::Extent2D { width: 160, height: 100 }),
                (6, vk::Extent2D { width: 320, height: 200 })
            ]
        );
        assert_eq!(config.reload_schedule, vec![4]);
        assert!(!config.temporal_reuse);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse("--help").unwrap_err().kind(), ErrorKind::DisplayHelp);
        assert_eq!(parse("--fast").unwrap_err().kind(), ErrorKind::UnknownArgument);
        for line in ["--flights", "--size 640by360", "--size 640x", "--resize-at 160x100", "--ambient 1,1"] {
            assert!(parse(line).is_err(), "{}", line);
        }
        for line in ["--flights 9", "--flights 3 --reservoirs 2", "--reservoirs 1", "--size 0x10", "--bindless 0"] {
            assert_eq!(parse(line).unwrap_err().kind(), ErrorKind::ValueValidation, "{}", line);
        }
        assert!(matches!(
            RuntimeConfiguration {
                resize_schedule: vec![(2, vk::Extent2D { width: 16, height: 0 })],
                ..Default::default()
            }
            .validate(),
            Err(ConfigError::OutOfRange { what: "size", .. })
        ));
    }
}
