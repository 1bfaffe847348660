use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::device::DeviceSlot;
use crate::error::{FlashError, FlashResult};

const SLOT_PLACEHOLDERS: [&str; 5] = ["dir", "device", "bus", "address", "location"];

/// Placeholders that tell the tool which attached device to talk to
const DEVICE_SELECTORS: [&str; 4] = ["device", "bus", "address", "location"];

/// One external tool invocation, fully expanded for a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub device_id: String,
}

impl ToolInvocation {
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Files and tool arguments applied uniformly to every device of a batch.
///
/// Steps are argument templates. `{name}` expands to the path of the file
/// registered under `name`, and `{dir}`, `{device}`, `{bus}`, `{address}`
/// and `{location}` expand to properties of the image directory and of
/// the device being flashed.
#[derive(Debug, Clone, Serialize)]
pub struct FlashJob {
    program: String,
    image_dir: PathBuf,
    files: BTreeMap<String, PathBuf>,
    steps: Vec<Vec<String>>,
}

impl FlashJob {
    pub fn builder(program: impl Into<String>, image_dir: impl Into<PathBuf>) -> FlashJobBuilder {
        FlashJobBuilder {
            program: program.into(),
            image_dir: image_dir.into(),
            files: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }

    pub fn steps(&self) -> &[Vec<String>] {
        &self.steps
    }

    /// True when every step names the device it runs against. Otherwise
    /// the tool picks a device on its own and only one may be attached.
    pub fn selects_device(&self) -> bool {
        self.steps.iter().all(|step| {
            step.iter()
                .flat_map(|arg| placeholders(arg))
                .any(|key| DEVICE_SELECTORS.contains(&key))
        })
    }

    /// Expand every step for one device
    pub fn invocations(&self, slot: &DeviceSlot) -> Vec<ToolInvocation> {
        self.steps
            .iter()
            .map(|step| ToolInvocation {
                program: self.program.clone(),
                args: step.iter().map(|arg| self.expand(arg, slot)).collect(),
                device_id: slot.id().to_owned(),
            })
            .collect()
    }

    fn expand(&self, template: &str, slot: &DeviceSlot) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    match self.lookup(key, slot) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push('{');
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);

        out
    }

    fn lookup(&self, key: &str, slot: &DeviceSlot) -> Option<String> {
        if let Some(path) = self.files.get(key) {
            return Some(path.display().to_string());
        }
        let info = &slot.info;
        match key {
            "dir" => Some(self.image_dir.display().to_string()),
            "device" => Some(info.id.clone()),
            "bus" => Some(info.bus.to_string()),
            "address" => Some(info.address.to_string()),
            "location" => Some(info.location_id().to_string()),
            _ => None,
        }
    }
}

pub struct FlashJobBuilder {
    program: String,
    image_dir: PathBuf,
    files: Vec<(String, PathBuf)>,
    steps: Vec<Vec<String>>,
}

impl FlashJobBuilder {
    /// Register a file under a placeholder name. Relative names are
    /// resolved against the image directory.
    pub fn file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.push((name.into(), path.into()));
        self
    }

    pub fn step<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn steps(mut self, steps: Vec<Vec<String>>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Validate the job. Every file must exist and every placeholder used
    /// by a step must be known.
    pub fn build(self) -> FlashResult<FlashJob> {
        if self.program.trim().is_empty() {
            return Err(FlashError::Configuration(
                "No flashing tool program given".to_string(),
            ));
        }

        if !self.image_dir.is_dir() {
            return Err(FlashError::Configuration(format!(
                "Image directory {} does not exist",
                self.image_dir.display()
            )));
        }

        let mut files = BTreeMap::new();
        for (name, path) in self.files {
            if SLOT_PLACEHOLDERS.contains(&name.as_str()) {
                return Err(FlashError::Configuration(format!(
                    "File name {:?} clashes with a built-in placeholder",
                    name
                )));
            }
            let path = if path.is_absolute() {
                path
            } else {
                self.image_dir.join(path)
            };
            if !path.is_file() {
                return Err(FlashError::Configuration(format!(
                    "{} file {} does not exist",
                    name,
                    path.display()
                )));
            }
            files.insert(name, path);
        }

        if self.steps.is_empty() {
            return Err(FlashError::Configuration(
                "Flash job has no tool steps".to_string(),
            ));
        }

        for step in &self.steps {
            for arg in step {
                for key in placeholders(arg) {
                    if !files.contains_key(key) && !SLOT_PLACEHOLDERS.contains(&key) {
                        return Err(FlashError::Configuration(format!(
                            "Unknown placeholder {{{}}} in step {:?}",
                            key, step
                        )));
                    }
                }
            }
        }

        Ok(FlashJob {
            program: self.program,
            image_dir: self.image_dir,
            files,
            steps: self.steps,
        })
    }
}

fn placeholders(template: &str) -> Vec<&str> {
    let mut keys = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                keys.push(&after[..end]);
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    keys
}
