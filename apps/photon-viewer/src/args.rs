//! Command line options.

use std::path::PathBuf;

use anyhow::{anyhow, bail};
use photon_core::constants::DEFAULT_FRAMES_IN_FLIGHT;

/// Default path of the compiled trace kernel.
pub const DEFAULT_SHADER: &str = "apps/photon-viewer/shaders/trace.spv";

/// Default output file for offline rendering.
pub const DEFAULT_OUTPUT: &str = "frame.png";

/// Viewer options parsed from the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewerArgs {
    pub width: u32,
    pub height: u32,
    pub frames_in_flight: usize,
    /// SPIR-V file of the trace kernel.
    pub shader: PathBuf,
    /// Geometry blob files, bound in order. Empty means the demo scene.
    pub geometry: Vec<PathBuf>,
    /// Render one frame to `output` instead of opening a window.
    pub offline: bool,
    pub output: PathBuf,
    pub vsync: bool,
    pub validation: bool,
    pub help: bool,
}

impl Default for ViewerArgs {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            shader: PathBuf::from(DEFAULT_SHADER),
            geometry: Vec::new(),
            offline: false,
            output: PathBuf::from(DEFAULT_OUTPUT),
            vsync: false,
            validation: cfg!(debug_assertions),
            help: false,
        }
    }
}

impl ViewerArgs {
    /// Parse from the process arguments.
    pub fn from_env() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        Self::parse_args(&args)
    }

    /// Parse from a slice of arguments; the first is the program name.
    pub fn parse_args(args: &[String]) -> anyhow::Result<Self> {
        let mut parsed = Self::default();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "-h" | "--help" => parsed.help = true,
                "--offline" => parsed.offline = true,
                "--vsync" => parsed.vsync = true,
                "--validation" => parsed.validation = true,
                "--width" => parsed.width = parse_value(flag, value(args, &mut i, flag)?)?,
                "--height" => parsed.height = parse_value(flag, value(args, &mut i, flag)?)?,
                "--frames-in-flight" => {
                    parsed.frames_in_flight = parse_value(flag, value(args, &mut i, flag)?)?;
                }
                "--shader" => parsed.shader = PathBuf::from(value(args, &mut i, flag)?),
                "--geometry" => parsed.geometry.push(PathBuf::from(value(args, &mut i, flag)?)),
                "-o" | "--output" => parsed.output = PathBuf::from(value(args, &mut i, flag)?),
                other => bail!("Unknown option '{other}' (see --help)"),
            }
            i += 1;
        }

        if parsed.width == 0 || parsed.height == 0 {
            bail!("Frame size must be non-zero, got {}x{}", parsed.width, parsed.height);
        }
        if parsed.frames_in_flight == 0 {
            bail!("--frames-in-flight must be at least 1");
        }

        Ok(parsed)
    }
}

/// Take the value following flag `args[*i]`.
fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> anyhow::Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{flag} expects a value"))
}

fn parse_value<T: std::str::FromStr>(flag: &str, raw: &str) -> anyhow::Result<T> {
    raw.parse()
        .map_err(|_| anyhow!("Invalid value '{raw}' for {flag}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ViewerArgs> {
        let args: Vec<String> = std::iter::once("photon-viewer")
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        ViewerArgs::parse_args(&args)
    }

    #[test]
    fn no_arguments_gives_defaults() {
        assert_eq!(parse(&[]).unwrap(), ViewerArgs::default());
    }

    #[test]
    fn parses_size_and_slots() {
        let args =
            parse(&["--width", "640", "--height", "480", "--frames-in-flight", "3"]).unwrap();
        assert_eq!((args.width, args.height, args.frames_in_flight), (640, 480, 3));
    }

    #[test]
    fn geometry_is_repeatable_and_ordered() {
        let args = parse(&["--geometry", "a.bin", "--geometry", "b.bin"]).unwrap();
        assert_eq!(args.geometry, [PathBuf::from("a.bin"), PathBuf::from("b.bin")]);
    }

    #[test]
    fn offline_with_output() {
        let args = parse(&["--offline", "-o", "out.ppm", "--shader", "k.spv"]).unwrap();
        assert!(args.offline);
        assert_eq!(args.output, PathBuf::from("out.ppm"));
        assert_eq!(args.shader, PathBuf::from("k.spv"));
    }

    #[test]
    fn flags() {
        let args = parse(&["--vsync", "--validation", "-h"]).unwrap();
        assert!(args.vsync && args.validation && args.help);
    }

    #[test]
    fn missing_value_is_an_error() {
        let err = parse(&["--width"]).unwrap_err();
        assert!(err.to_string().contains("--width"));
    }

    #[test]
    fn bad_number_is_an_error() {
        assert!(parse(&["--height", "tall"]).is_err());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(parse(&["--width", "0"]).is_err());
        assert!(parse(&["--frames-in-flight", "0"]).is_err());
    }

    #[test]
    fn unknown_option_is_an_error() {
        assert!(parse(&["--fast"]).is_err());
    }
}
