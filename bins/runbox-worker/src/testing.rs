// In-memory container runtime for tests
// Tracks live images and containers so cleanup can be asserted directly

use crate::error::RuntimeError;
use crate::runtime::{BuildOutput, ContainerRuntime, ContainerSpec, LogStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Build completes but reports this error
    pub build_error: Option<String>,
    /// Build transport fails outright
    pub build_unavailable: bool,
    /// Image is stored immediately, then the build call blocks this long
    pub build_delay: Option<Duration>,
    pub create_error: Option<String>,
    /// Create call blocks this long before doing anything
    pub create_delay: Option<Duration>,
    pub start_error: Option<String>,
    pub log_chunks: Vec<Vec<u8>>,
    /// Prefix every chunk with the container name
    pub tag_chunks_with_name: bool,
    /// Stream stays open after the chunks, like a program that never exits
    pub log_hangs: bool,
    pub log_open_error: Option<String>,
    /// Stream fails after the chunks instead of closing
    pub log_fail_after_chunks: Option<String>,
    pub exit_code: i64,
    /// Exit code cannot be read
    pub wait_error: Option<String>,
    pub remove_container_error: Option<RuntimeError>,
    pub remove_image_error: Option<RuntimeError>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            build_error: None,
            build_unavailable: false,
            build_delay: None,
            create_error: None,
            create_delay: None,
            start_error: None,
            log_chunks: vec![b"hello\n".to_vec()],
            tag_chunks_with_name: false,
            log_hangs: false,
            log_open_error: None,
            log_fail_after_chunks: None,
            exit_code: 0,
            wait_error: None,
            remove_container_error: None,
            remove_image_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub name: String,
    pub image: String,
    pub running: bool,
    pub killed: bool,
}

#[derive(Default)]
struct MockState {
    images: HashSet<String>,
    containers: HashMap<String, MockContainer>,
    calls: Vec<String>,
    next_id: u64,
}

pub struct MockRuntime {
    behavior: MockBehavior,
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn healthy() -> Self {
        Self::new(MockBehavior::default())
    }

    pub fn live_images(&self) -> HashSet<String> {
        self.state.lock().unwrap().images.clone()
    }

    pub fn live_containers(&self) -> Vec<MockContainer> {
        self.state.lock().unwrap().containers.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Register a container as if it had been launched
    pub fn insert_running(&self, id: &str, name: &str, image: &str) {
        let mut state = self.state.lock().unwrap();
        state.images.insert(image.to_string());
        state.containers.insert(
            id.to_string(),
            MockContainer {
                name: name.to_string(),
                image: image.to_string(),
                running: true,
                killed: false,
            },
        );
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    /// Resolve by id or by name, as the runtime does
    fn resolve(state: &MockState, key: &str) -> Option<String> {
        if state.containers.contains_key(key) {
            return Some(key.to_string());
        }
        state
            .containers
            .iter()
            .find(|(_, c)| c.name == key)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn build_image(&self, context: Bytes, tag: &str) -> Result<BuildOutput, RuntimeError> {
        self.record(format!("build:{}:{}", tag, context.len()));

        if self.behavior.build_unavailable {
            return Err(RuntimeError::Unavailable("daemon socket closed".to_string()));
        }

        if let Some(error) = &self.behavior.build_error {
            return Ok(BuildOutput {
                log: format!("Step 1/3 : FROM golang\n{}\n", error),
                error: Some(error.clone()),
            });
        }

        self.state.lock().unwrap().images.insert(tag.to_string());

        if let Some(delay) = self.behavior.build_delay {
            tokio::time::sleep(delay).await;
        }

        Ok(BuildOutput {
            log: format!("Step 1/3 : FROM golang\nSuccessfully tagged {}\n", tag),
            error: None,
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(format!("create:{}", spec.name));

        if let Some(error) = &self.behavior.create_error {
            return Err(RuntimeError::Api(error.clone()));
        }

        if let Some(delay) = self.behavior.create_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if !state.images.contains(&spec.image) {
            return Err(RuntimeError::NotFound(format!("image {}", spec.image)));
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Conflict(format!("name {} in use", spec.name)));
        }

        state.next_id += 1;
        let id = format!("cid-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                image: spec.image.clone(),
                running: false,
                killed: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("start:{}", id));

        if let Some(error) = &self.behavior.start_error {
            return Err(RuntimeError::Api(error.clone()));
        }

        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("container {}", id))),
        }
    }

    fn stream_logs<'a>(&'a self, id: &'a str) -> LogStream<'a> {
        self.record(format!("logs:{}", id));

        if let Some(error) = &self.behavior.log_open_error {
            return stream::once(futures_util::future::ready(Err(RuntimeError::Api(
                error.clone(),
            ))))
            .boxed();
        }

        let name = {
            let state = self.state.lock().unwrap();
            state.containers.get(id).map(|c| c.name.clone()).unwrap_or_default()
        };

        let chunks: Vec<Result<Bytes, RuntimeError>> = self
            .behavior
            .log_chunks
            .iter()
            .map(|chunk| {
                let mut data = Vec::new();
                if self.behavior.tag_chunks_with_name {
                    data.extend_from_slice(name.as_bytes());
                    data.extend_from_slice(b": ");
                }
                data.extend_from_slice(chunk);
                Ok(Bytes::from(data))
            })
            .collect();

        let body = stream::iter(chunks);
        if self.behavior.log_hangs {
            body.chain(stream::pending()).boxed()
        } else if let Some(error) = &self.behavior.log_fail_after_chunks {
            body.chain(stream::once(futures_util::future::ready(Err(
                RuntimeError::Api(error.clone()),
            ))))
            .boxed()
        } else {
            body.boxed()
        }
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        self.record(format!("wait:{}", id));

        if self.behavior.log_hangs {
            futures_util::future::pending::<()>().await;
        }

        if let Some(error) = &self.behavior.wait_error {
            return Err(RuntimeError::Api(error.clone()));
        }

        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = false;
                Ok(self.behavior.exit_code)
            }
            None => Err(RuntimeError::NotFound(format!("container {}", id))),
        }
    }

    async fn stop_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.record(format!("stop:{}:{}", id, if force { "kill" } else { "graceful" }));

        let mut state = self.state.lock().unwrap();
        let key = Self::resolve(&state, id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", id)))?;
        let container = state
            .containers
            .get_mut(&key)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", id)))?;

        if !container.running {
            return Err(RuntimeError::Conflict(format!("container {} is not running", id)));
        }
        container.running = false;
        container.killed = force;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.record(format!("remove_container:{}", id));

        if let Some(error) = &self.behavior.remove_container_error {
            return Err(error.clone());
        }

        let mut state = self.state.lock().unwrap();
        let key = Self::resolve(&state, id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", id)))?;
        if state.containers[&key].running && !force {
            return Err(RuntimeError::Conflict(format!("container {} is running", id)));
        }
        state.containers.remove(&key);
        Ok(())
    }

    async fn remove_image(&self, tag: &str, force: bool) -> Result<(), RuntimeError> {
        self.record(format!("remove_image:{}", tag));

        if let Some(error) = &self.behavior.remove_image_error {
            return Err(error.clone());
        }

        let mut state = self.state.lock().unwrap();
        if !state.images.contains(tag) {
            return Err(RuntimeError::NotFound(format!("image {}", tag)));
        }
        if !force && state.containers.values().any(|c| c.image == tag) {
            return Err(RuntimeError::Conflict(format!("image {} is in use", tag)));
        }
        state.images.remove(tag);
        Ok(())
    }
}
