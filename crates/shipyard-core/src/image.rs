//! Image descriptors and build context assembly.
//!
//! An `ImageSpec` is an ordered list of Dockerfile layers. Assembling a job
//! renders the layers into a Dockerfile and packs it into an in-memory tar
//! archive the build engine consumes as its build context.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, JobId, Result};

/// File name of the rendered Dockerfile inside the build context.
pub const DOCKERFILE: &str = "Dockerfile";

/// Label attached to every image built by a job.
pub const JOB_LABEL: &str = "shipyard.job.id";

/// A buildable image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Repository name, optionally prefixed by a registry host.
    pub name: String,
    pub tag: String,
    pub layers: Vec<Layer>,
}

/// One Dockerfile instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Layer {
    /// Start of a build stage (`FROM base:tag [AS alias]`).
    Stage {
        base: String,
        tag: String,
        #[serde(default)]
        alias: Option<String>,
    },
    Label {
        name: String,
        value: String,
    },
    Env {
        name: String,
        value: String,
    },
    Arg {
        name: String,
        #[serde(default)]
        default: Option<String>,
    },
    Workdir {
        path: String,
    },
    Run {
        command: String,
    },
    Copy {
        source: String,
        destination: String,
        #[serde(default)]
        from: Option<String>,
    },
    Expose {
        port: u16,
    },
    Entrypoint {
        command: Vec<String>,
    },
    Cmd {
        command: Vec<String>,
    },
}

impl Layer {
    fn render(&self) -> String {
        match self {
            Layer::Stage { base, tag, alias } => match alias {
                Some(alias) => format!("FROM {}:{} AS {}", base, tag, alias),
                None => format!("FROM {}:{}", base, tag),
            },
            Layer::Label { name, value } => format!("LABEL {}={}", name, quote(value)),
            Layer::Env { name, value } => format!("ENV {}={}", name, quote(value)),
            Layer::Arg { name, default } => match default {
                Some(default) => format!("ARG {}={}", name, quote(default)),
                None => format!("ARG {}", name),
            },
            Layer::Workdir { path } => format!("WORKDIR {}", path),
            Layer::Run { command } => format!("RUN {}", command),
            Layer::Copy {
                source,
                destination,
                from,
            } => match from {
                Some(from) => format!("COPY --from={} {} {}", from, source, destination),
                None => format!("COPY {} {}", source, destination),
            },
            Layer::Expose { port } => format!("EXPOSE {}", port),
            Layer::Entrypoint { command } => format!("ENTRYPOINT {}", exec_form(command)),
            Layer::Cmd { command } => format!("CMD {}", exec_form(command)),
        }
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn exec_form(command: &[String]) -> String {
    let parts: Vec<String> = command.iter().map(|part| quote(part)).collect();
    format!("[{}]", parts.join(", "))
}

impl ImageSpec {
    /// `name:tag`, the tag given to the built image.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// Check the spec can be rendered into a usable Dockerfile.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("image name is empty".to_string()));
        }
        if self.tag.trim().is_empty() || self.tag.contains(char::is_whitespace) {
            return Err(Error::InvalidInput(format!(
                "invalid tag for image {}: {:?}",
                self.name, self.tag
            )));
        }
        match self.layers.first() {
            Some(Layer::Stage { .. }) => Ok(()),
            Some(_) => Err(Error::InvalidInput(format!(
                "image {} must start with a stage layer",
                self.full_name()
            ))),
            None => Err(Error::InvalidInput(format!(
                "image {} has no layers",
                self.full_name()
            ))),
        }
    }

    /// Copy of this spec with the job label inserted after the first layer.
    pub fn with_job_label(&self, id: JobId) -> Self {
        let mut labelled = self.clone();
        let at = labelled.layers.len().min(1);
        labelled.layers.insert(
            at,
            Layer::Label {
                name: JOB_LABEL.to_string(),
                value: id.to_string(),
            },
        );
        labelled
    }

    /// `base:tag` of every stage layer.
    pub fn stage_images(&self) -> Vec<String> {
        self.layers
            .iter()
            .filter_map(|layer| match layer {
                Layer::Stage { base, tag, .. } => Some(format!("{}:{}", base, tag)),
                _ => None,
            })
            .collect()
    }

    /// Render the Dockerfile text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for layer in &self.layers {
            out.push_str(&layer.render());
            out.push('\n');
        }
        out
    }

    /// Pack the rendered Dockerfile into a tar build context.
    pub fn to_context(&self) -> Result<Bytes> {
        self.validate()?;
        let dockerfile = self.render();

        let mut header = tar::Header::new_gnu();
        header.set_size(dockerfile.len() as u64);
        header.set_mode(0o644);

        let mut archive = tar::Builder::new(Vec::new());
        archive
            .append_data(&mut header, DOCKERFILE, dockerfile.as_bytes())
            .map_err(|e| Error::Internal(format!("failed to pack build context: {}", e)))?;
        let data = archive
            .into_inner()
            .map_err(|e| Error::Internal(format!("failed to finish build context: {}", e)))?;

        Ok(Bytes::from(data))
    }
}

/// Options forwarded to the build engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    pub build_args: HashMap<String, String>,
    /// Stage to stop at in a multi-stage build.
    pub target: Option<String>,
    pub platform: Option<String>,
    pub no_cache: bool,
    /// Always attempt to pull newer base images.
    pub pull: bool,
    pub network_mode: Option<String>,
    pub labels: HashMap<String, String>,
}
