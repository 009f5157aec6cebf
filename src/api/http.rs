//! HTTP implementation of the lifecycle API.

use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::types::{Credentials, ImageId, RunState, VmId, VmSpec, VmSummary};
use super::{ApiFuture, LifecycleApi};
use crate::config::ApiConfig;

/// Default endpoint of the hosted lifecycle service.
pub const DEFAULT_BASE_URL: &str = "https://api.vers.sh/api/v1";

/// Errors raised by [`HttpLifecycleApi`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HttpApiError {
    /// Raised when the HTTP client cannot be configured.
    #[error("http client configuration failed: {0}")]
    Client(String),
    /// Raised when the request never produced a response.
    #[error("{endpoint}: request failed: {message}")]
    Request {
        /// Method and path of the call.
        endpoint: String,
        /// Transport error text.
        message: String,
    },
    /// Raised for any non-success HTTP status.
    #[error("{endpoint}: HTTP {status}: {body}")]
    Status {
        /// Method and path of the call.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body as text.
        body: String,
    },
    /// Raised when a success body cannot be decoded.
    #[error("{endpoint}: failed to decode response: {message}")]
    Decode {
        /// Method and path of the call.
        endpoint: String,
        /// Decoder error text.
        message: String,
    },
    /// Raised when a decoded body lacks the expected identifier.
    #[error("{endpoint}: unexpected response: {message}")]
    UnexpectedResponse {
        /// Method and path of the call.
        endpoint: String,
        /// Description of what was missing.
        message: String,
    },
}

#[derive(Serialize)]
struct NewRootRequest {
    vm_config: VmConfigBody,
}

#[derive(Serialize)]
struct VmConfigBody {
    vcpu_count: u32,
    mem_size_mib: u32,
    fs_size_mib: u32,
}

#[derive(Deserialize)]
struct VmIdResponse {
    vm_id: VmId,
}

#[derive(Deserialize)]
struct BranchResponse {
    #[serde(default)]
    vm_id: Option<VmId>,
    #[serde(default)]
    vms: Vec<VmIdResponse>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Bare(Vec<VmSummary>),
    Wrapped { vms: Vec<VmSummary> },
}

#[derive(Deserialize)]
struct CommitResponse {
    commit_id: ImageId,
}

#[derive(Serialize)]
struct FromCommitRequest<'a> {
    commit_id: &'a ImageId,
}

#[derive(Serialize)]
struct StateRequest {
    state: RunState,
}

/// Lifecycle API backed by the hosted REST service.
#[derive(Clone, Debug)]
pub struct HttpLifecycleApi {
    base_url: Url,
    api_key: String,
    client: reqwest::Client,
}

impl HttpLifecycleApi {
    /// Builds a client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HttpApiError::Client`] when the configuration is invalid or
    /// the HTTP client cannot be built.
    pub fn new(config: &ApiConfig) -> Result<Self, HttpApiError> {
        config
            .validate()
            .map_err(|err| HttpApiError::Client(err.to_string()))?;
        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|err| {
            HttpApiError::Client(format!("invalid base URL {}: {err}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(HttpApiError::Client(format!(
                "base URL {} cannot carry a path",
                config.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| HttpApiError::Client(err.to_string()))?;
        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            client,
        })
    }

    /// Appends `segments` to the base URL, percent-encoding each one.
    fn endpoint_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Vec<u8>, HttpApiError> {
        debug!(endpoint, "lifecycle api call");
        let response = request.send().await.map_err(|err| HttpApiError::Request {
            endpoint: endpoint.to_owned(),
            message: err.to_string(),
        })?;
        let status = response.status();
        let body = response.bytes().await.map_err(|err| HttpApiError::Request {
            endpoint: endpoint.to_owned(),
            message: err.to_string(),
        })?;

        if status.is_success() {
            return Ok(body.to_vec());
        }

        Err(HttpApiError::Status {
            endpoint: endpoint.to_owned(),
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    fn decode<T: DeserializeOwned>(endpoint: &str, body: &[u8]) -> Result<T, HttpApiError> {
        serde_json::from_slice(body).map_err(|err| HttpApiError::Decode {
            endpoint: endpoint.to_owned(),
            message: err.to_string(),
        })
    }

    async fn list(&self) -> Result<Vec<VmSummary>, HttpApiError> {
        let endpoint = "GET /vms";
        let url = self.endpoint_url(&["vms"]);
        let body = self.send(endpoint, self.request(Method::GET, url)).await?;
        Ok(match Self::decode::<ListResponse>(endpoint, &body)? {
            ListResponse::Bare(vms) | ListResponse::Wrapped { vms } => vms,
        })
    }

    async fn create(&self, spec: &VmSpec) -> Result<VmId, HttpApiError> {
        let mut url = self.endpoint_url(&["vm", "new_root"]);
        if spec.wait_boot {
            url.query_pairs_mut().append_pair("wait_boot", "true");
        }
        let endpoint = format!("POST {}", url.path());
        let payload = NewRootRequest {
            vm_config: VmConfigBody {
                vcpu_count: spec.vcpu_count,
                mem_size_mib: spec.mem_size_mib,
                fs_size_mib: spec.fs_size_mib,
            },
        };
        let body = self
            .send(&endpoint, self.request(Method::POST, url).json(&payload))
            .await?;
        Ok(Self::decode::<VmIdResponse>(&endpoint, &body)?.vm_id)
    }

    async fn branch(&self, vm_id: &VmId) -> Result<VmId, HttpApiError> {
        let url = self.endpoint_url(&["vm", vm_id.as_str(), "branch"]);
        let endpoint = format!("POST {}", url.path());
        let body = self
            .send(&endpoint, self.request(Method::POST, url))
            .await?;
        let parsed = Self::decode::<BranchResponse>(&endpoint, &body)?;
        parsed
            .vm_id
            .or_else(|| parsed.vms.into_iter().next().map(|vm| vm.vm_id))
            .ok_or_else(|| HttpApiError::UnexpectedResponse {
                endpoint,
                message: String::from("no VM identifier in branch response"),
            })
    }

    async fn commit(&self, vm_id: &VmId, keep_paused: bool) -> Result<ImageId, HttpApiError> {
        let mut url = self.endpoint_url(&["vm", vm_id.as_str(), "commit"]);
        if keep_paused {
            url.query_pairs_mut().append_pair("keep_paused", "true");
        }
        let endpoint = format!("POST {}", url.path());
        let body = self
            .send(&endpoint, self.request(Method::POST, url))
            .await?;
        Ok(Self::decode::<CommitResponse>(&endpoint, &body)?.commit_id)
    }

    async fn restore(&self, image_id: &ImageId) -> Result<VmId, HttpApiError> {
        let endpoint = "POST /vm/from_commit";
        let payload = FromCommitRequest {
            commit_id: image_id,
        };
        let url = self.endpoint_url(&["vm", "from_commit"]);
        let body = self
            .send(endpoint, self.request(Method::POST, url).json(&payload))
            .await?;
        Ok(Self::decode::<VmIdResponse>(endpoint, &body)?.vm_id)
    }
}

impl LifecycleApi for HttpLifecycleApi {
    type Error = HttpApiError;

    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> ApiFuture<'a, VmId, Self::Error> {
        Box::pin(self.create(spec))
    }

    fn list_vms(&self) -> ApiFuture<'_, Vec<VmSummary>, Self::Error> {
        Box::pin(self.list())
    }

    fn get_vm<'a>(&'a self, vm_id: &'a VmId) -> ApiFuture<'a, Option<VmSummary>, Self::Error> {
        Box::pin(async move {
            let vms = self.list().await?;
            Ok(vms.into_iter().find(|vm| &vm.id == vm_id))
        })
    }

    fn delete_vm<'a>(&'a self, vm_id: &'a VmId) -> ApiFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let url = self.endpoint_url(&["vm", vm_id.as_str()]);
            let endpoint = format!("DELETE {}", url.path());
            self.send(&endpoint, self.request(Method::DELETE, url))
                .await?;
            Ok(())
        })
    }

    fn branch_vm<'a>(&'a self, vm_id: &'a VmId) -> ApiFuture<'a, VmId, Self::Error> {
        Box::pin(self.branch(vm_id))
    }

    fn commit_vm<'a>(
        &'a self,
        vm_id: &'a VmId,
        keep_paused: bool,
    ) -> ApiFuture<'a, ImageId, Self::Error> {
        Box::pin(self.commit(vm_id, keep_paused))
    }

    fn restore_vm<'a>(&'a self, image_id: &'a ImageId) -> ApiFuture<'a, VmId, Self::Error> {
        Box::pin(self.restore(image_id))
    }

    fn set_run_state<'a>(
        &'a self,
        vm_id: &'a VmId,
        state: RunState,
    ) -> ApiFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let url = self.endpoint_url(&["vm", vm_id.as_str(), "state"]);
            let endpoint = format!("PATCH {}", url.path());
            self.send(
                &endpoint,
                self.request(Method::PATCH, url)
                    .json(&StateRequest { state }),
            )
            .await?;
            Ok(())
        })
    }

    fn fetch_credentials<'a>(
        &'a self,
        vm_id: &'a VmId,
    ) -> ApiFuture<'a, Credentials, Self::Error> {
        Box::pin(async move {
            let url = self.endpoint_url(&["vm", vm_id.as_str(), "ssh_key"]);
            let endpoint = format!("GET {}", url.path());
            let body = self
                .send(&endpoint, self.request(Method::GET, url))
                .await?;
            Self::decode::<Credentials>(&endpoint, &body)
        })
    }
}
