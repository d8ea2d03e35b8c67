//! Launch parameters for MCP servers
//!
//! Every server the inline agents use ships as a container image that is run
//! attached to stdin. Environment values are passed by name only (`-e KEY`),
//! so secrets stay out of the argument list; the values go into the spawned
//! `docker` process environment.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Command line and environment of a stdio MCP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParams {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ServerParams {
    pub fn new(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }
}

impl fmt::Display for ServerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Builder for `docker run -i --rm -e KEY... image [args...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerServer {
    image: String,
    env: BTreeMap<String, String>,
    args: Vec<String>,
}

impl DockerServer {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: BTreeMap::new(),
            args: Vec::new(),
        }
    }

    /// Forward these variables into the container
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Argument after the image, e.g. the server script
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn into_params(self) -> ServerParams {
        let mut args = vec!["run".to_string(), "-i".to_string(), "--rm".to_string()];
        for key in self.env.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        args.push(self.image);
        args.extend(self.args);

        ServerParams {
            command: "docker".to_string(),
            args,
            env: self.env,
        }
    }
}
