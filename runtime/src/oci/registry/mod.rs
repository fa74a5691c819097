//! OCI distribution registry client.
//!
//! [`RegistryResolver`] maps a reference to a registry repository and hands
//! out the two content-store views of it:
//!
//! - [`RegistryFetcher`]: a [`crate::content::Provider`] pulling blobs and manifests
//! - [`RegistryPusher`]: a [`crate::content::Ingester`] uploading them, with
//!   existence checks and cross-repository mounts
//!
//! Protocol and token negotiation go through `oci-distribution`'s
//! [`Client`]. Existence checks and streamed blob uploads, which the client
//! does not offer, are sent directly with the token it negotiated.

mod fetcher;
mod pusher;

pub use fetcher::RegistryFetcher;
pub use pusher::RegistryPusher;

use std::sync::Arc;

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use a3s_oci_core::{
    annotations, media_type, Descriptor, Digest, EngineConfig, OciError, RegistryConfig, Result,
    RetryPolicy,
};

use super::credentials::{Credential, CredentialProvider};
use super::reference::ImageReference;
use super::retry::retry_on_failure;

/// Resolves references and creates fetchers and pushers.
#[derive(Clone)]
pub struct RegistryResolver {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    config: RegistryConfig,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RegistryResolver {
    pub fn new(credentials: Arc<dyn CredentialProvider>, config: &EngineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.registry.request_timeout())
            .user_agent(config.registry.user_agent.clone())
            .build()
            .map_err(|e| OciError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            credentials,
            config: config.registry.clone(),
            retry: config.retry.clone(),
            cancel: CancellationToken::new(),
        })
    }

    /// Abort retry waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Look up a reference and return its canonical name and descriptor.
    ///
    /// The descriptor carries the reference name annotation.
    pub async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)> {
        let image_ref = ImageReference::parse(reference)?;
        let client = self.repository_client(&image_ref)?;
        let object = image_ref.object();

        let (data, registry_digest) = retry_on_failure(&self.retry, &self.cancel, "resolve", || {
            client.pull_manifest(&object)
        })
        .await
        .map_err(|e| e.context(format!("resolving {}", image_ref)))?;

        let digest = Digest::from_bytes(&data);
        if let Some(expected) = image_ref.digest.as_ref() {
            if &digest != expected {
                return Err(OciError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }
        // The client reports the Docker-Content-Digest header when present.
        if let Some(reported) = Digest::parse(&registry_digest)
            .ok()
            .filter(|d| d.algorithm() == digest.algorithm())
        {
            if reported != digest {
                return Err(OciError::DigestMismatch {
                    expected: reported.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        let name = image_ref.full_reference();
        let desc = Descriptor::new(media_type_from_body(&data)?, digest, data.len() as u64)
            .with_annotation(annotations::REF_NAME, name.clone());

        tracing::debug!(reference = %name, digest = %desc.digest, "Resolved reference");
        Ok((name, desc))
    }

    /// Provider reading from the reference's repository.
    pub fn fetcher(&self, reference: &str) -> Result<RegistryFetcher> {
        let image_ref = ImageReference::parse(reference)?;
        Ok(RegistryFetcher::new(Arc::new(self.repository_client(&image_ref)?)))
    }

    /// Ingester writing to the reference's repository.
    ///
    /// Root manifests (those carrying a reference name annotation) are
    /// tagged with the reference's tag; everything else is pushed by digest.
    pub fn pusher(&self, reference: &str) -> Result<RegistryPusher> {
        let image_ref = ImageReference::parse(reference)?;
        Ok(RegistryPusher::new(
            Arc::new(self.repository_client(&image_ref)?),
            image_ref.tag.clone(),
            self.retry.clone(),
            self.cancel.clone(),
        ))
    }

    fn repository_client(&self, image_ref: &ImageReference) -> Result<RepositoryClient> {
        let plain_http = self.config.is_plain_http(&image_ref.registry);
        let host = image_ref.api_host().to_string();
        let scheme = if plain_http { "http" } else { "https" };
        let base = Url::parse(&format!("{}://{}/", scheme, host)).map_err(|e| {
            OciError::ConfigError(format!("Invalid registry host '{}': {}", image_ref.registry, e))
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in self.config.all_headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| OciError::ConfigError(format!("Invalid header '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| OciError::ConfigError(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let oci = Client::new(ClientConfig {
            protocol: if plain_http {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            platform_resolver: None,
            ..Default::default()
        });

        Ok(RepositoryClient {
            oci,
            http: self.http.clone(),
            auth: registry_auth(self.credentials.credential(&image_ref.registry)?),
            registry: image_ref.registry.clone(),
            host,
            repository: image_ref.repository.clone(),
            base,
            headers,
            pull_authorization: OnceCell::new(),
            push_authorization: OnceCell::new(),
        })
    }
}

/// Map an engine credential to the client's authentication.
fn registry_auth(credential: Credential) -> RegistryAuth {
    match credential {
        Credential::Basic { username, password } => RegistryAuth::Basic(username, password),
        // Identity tokens are exchanged at the token realm in place of a password.
        Credential::Bearer(token) => RegistryAuth::Basic(String::new(), token),
        Credential::Anonymous => RegistryAuth::Anonymous,
    }
}

fn media_type_from_body(data: &[u8]) -> Result<String> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Sniffed {
        media_type: Option<String>,
        manifests: Option<serde_json::Value>,
    }

    let sniffed: Sniffed = serde_json::from_slice(data)
        .map_err(|e| OciError::MalformedContent(format!("Invalid manifest document: {}", e)))?;
    Ok(match (sniffed.media_type, sniffed.manifests) {
        (Some(mt), _) => mt,
        (None, Some(_)) => media_type::oci_index(),
        (None, None) => media_type::oci_manifest(),
    })
}

/// Authorization negotiated by the client for one operation.
#[derive(Debug, Clone)]
enum Authorization {
    Anonymous,
    Basic(String, String),
    Bearer(String),
}

/// Access to one repository on one registry.
///
/// Caches the authorization negotiated for pulling and pushing; a fresh
/// client is created for every fetcher or pusher.
pub(crate) struct RepositoryClient {
    oci: Client,
    /// Requests the distribution client has no call for
    http: reqwest::Client,
    auth: RegistryAuth,
    /// Registry as named in references
    registry: String,
    /// Host serving the distribution API
    host: String,
    repository: String,
    base: Url,
    headers: HeaderMap,
    pull_authorization: OnceCell<Authorization>,
    push_authorization: OnceCell<Authorization>,
}

impl RepositoryClient {
    pub(crate) fn registry(&self) -> &str {
        &self.registry
    }

    pub(crate) fn repository(&self) -> &str {
        &self.repository
    }

    /// Client reference for a tag or digest in this repository.
    fn reference(&self, object: &str) -> Reference {
        if Digest::parse(object).is_ok() {
            Reference::with_digest(self.host.clone(), self.repository.clone(), object.to_string())
        } else {
            Reference::with_tag(self.host.clone(), self.repository.clone(), object.to_string())
        }
    }

    /// Negotiate credentials for `operation` once; the client keeps the
    /// token for its own requests.
    async fn authorize(&self, operation: RegistryOperation) -> Result<&Authorization> {
        let cell = match operation {
            RegistryOperation::Pull => &self.pull_authorization,
            RegistryOperation::Push => &self.push_authorization,
        };
        cell.get_or_try_init(|| async {
            let token = self
                .oci
                .auth(&self.reference(DEFAULT_OBJECT), &self.auth, operation)
                .await
                .map_err(|e| self.map_error("authenticate", e))?;
            let authorization = match (token, &self.auth) {
                (Some(token), _) => Authorization::Bearer(token),
                (None, RegistryAuth::Basic(username, password)) => {
                    Authorization::Basic(username.clone(), password.clone())
                }
                (None, _) => Authorization::Anonymous,
            };
            tracing::debug!(
                registry = %self.registry,
                repository = %self.repository,
                operation = ?operation,
                "Negotiated registry authorization"
            );
            Ok::<_, OciError>(authorization)
        })
        .await
    }

    /// GET a manifest by tag or digest: body and registry digest.
    async fn pull_manifest(&self, object: &str) -> Result<(Vec<u8>, String)> {
        self.authorize(RegistryOperation::Pull).await?;
        let accept = media_type::manifest_accept_types();
        let accept: Vec<&str> = accept.iter().map(String::as_str).collect();
        self.oci
            .pull_manifest_raw(&self.reference(object), &self.auth, &accept)
            .await
            .map_err(|e| self.map_error(&format!("manifest {}", object), e))
    }

    /// PUT a manifest under a tag or digest.
    pub(crate) async fn push_manifest(&self, object: &str, data: Vec<u8>, media_type: &str) -> Result<()> {
        self.authorize(RegistryOperation::Push).await?;
        let content_type = match media_type.parse() {
            Ok(value) => value,
            Err(_) => return Err(self.error(format!("invalid media type '{}'", media_type))),
        };
        self.oci
            .push_manifest_raw(&self.reference(object), data, content_type)
            .await
            .map(|_| ())
            .map_err(|e| self.map_error(&format!("manifest {}", object), e))
    }

    /// Stream a blob into `out`.
    pub(crate) async fn pull_blob<W>(&self, desc: &Descriptor, out: W) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        self.authorize(RegistryOperation::Pull).await?;
        let layer = OciDescriptor {
            media_type: desc.media_type.clone(),
            digest: desc.digest.to_string(),
            size: desc.size as i64,
            ..Default::default()
        };
        self.oci
            .pull_blob(&self.reference(desc.digest.as_str()), &layer, out)
            .await
            .map_err(|e| self.map_error(&format!("blob {}", desc.digest), e))
    }

    /// Mount `digest` from another repository on the same registry.
    pub(crate) async fn mount_blob(&self, from: &str, digest: &Digest) -> Result<()> {
        self.authorize(RegistryOperation::Push).await?;
        let source = Reference::with_digest(self.host.clone(), from.to_string(), digest.to_string());
        match self
            .oci
            .mount_blob(&self.reference(digest.as_str()), &source, digest.as_str())
            .await
        {
            Ok(()) => Ok(()),
            // 202: the registry opened an upload session instead of mounting.
            Err(OciDistributionError::SpecViolationError(_)) => Err(OciError::NotFound(format!(
                "blob {} not mountable from {}",
                digest, from
            ))),
            Err(e) => Err(self.map_error("mount", e)),
        }
    }

    /// `<base>/v2/<repository>/<kind>/<object>`
    pub(crate) fn url(&self, kind: &str, object: &str) -> Result<Url> {
        self.base
            .join(&format!("v2/{}/{}/{}", self.repository, kind, object))
            .map_err(|e| OciError::ConfigError(format!("Invalid registry URL: {}", e)))
    }

    /// Resolve a `Location` header against the registry base.
    pub(crate) fn location(&self, response: &Response) -> Result<Url> {
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| self.error("upload response without Location header"))?;
        self.base
            .join(location)
            .map_err(|e| self.error(format!("invalid Location '{}': {}", location, e)))
    }

    /// Blob or manifest endpoint for a descriptor.
    pub(crate) fn content_url(&self, desc: &Descriptor) -> Result<Url> {
        let kind = if is_manifest_like(&desc.media_type) {
            "manifests"
        } else {
            "blobs"
        };
        self.url(kind, desc.digest.as_str())
    }

    pub(crate) fn error(&self, message: impl Into<String>) -> OciError {
        OciError::RegistryError {
            registry: self.registry.clone(),
            message: message.into(),
        }
    }

    fn not_found(&self, what: &str) -> OciError {
        OciError::NotFound(format!("{}/{}: {}", self.registry, self.repository, what))
    }

    /// Map a client error. Unknown blobs, manifests and repositories become
    /// `NotFound`.
    fn map_error(&self, what: &str, error: OciDistributionError) -> OciError {
        if is_not_found(&error) {
            self.not_found(what)
        } else {
            self.error(format!("{}: {}", what, error))
        }
    }

    /// Map a non-success response to an error. 404 becomes `NotFound`.
    pub(crate) async fn status_error(&self, what: &str, response: Response) -> OciError {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return self.not_found(what);
        }
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(512).collect();
        self.error(format!("{} returned {}: {}", what, status, body.trim()))
    }

    /// Whether `url` is served by this registry. Credentials and custom
    /// headers are only ever sent there.
    fn is_registry_url(&self, url: &Url) -> bool {
        url.host_str() == self.base.host_str()
            && url.port_or_known_default() == self.base.port_or_known_default()
    }

    /// Send a request built outside the distribution client, with the
    /// authorization negotiated for `operation`.
    ///
    /// Requests leaving the registry host (upload locations on a storage
    /// backend) go out bare.
    pub(crate) async fn send(
        &self,
        operation: RegistryOperation,
        url: &Url,
        request: RequestBuilder,
    ) -> Result<Response> {
        let request = if self.is_registry_url(url) {
            let request = request.headers(self.headers.clone());
            match self.authorize(operation).await? {
                Authorization::Bearer(token) => request.bearer_auth(token),
                Authorization::Basic(username, password) => {
                    request.basic_auth(username, Some(password))
                }
                Authorization::Anonymous => request,
            }
        } else {
            tracing::debug!(
                registry = %self.registry,
                host = url.host_str().unwrap_or_default(),
                "Sending request to another host without registry credentials"
            );
            request
        };
        request
            .send()
            .await
            .map_err(|e| self.error(format!("request to {} failed: {}", url.path(), e)))
    }

    /// HEAD a blob or manifest. 404 is `false`, not an error.
    pub(crate) async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        let url = self.content_url(desc)?;
        let accept = media_type::manifest_accept_types().join(", ");
        let request = self.http.head(url.clone()).header(ACCEPT, accept);
        let response = self.send(RegistryOperation::Push, &url, request).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.status_error(&format!("HEAD {}", desc.digest), response).await),
        }
    }
}

/// Object used when a reference only needs to name the repository.
const DEFAULT_OBJECT: &str = "latest";

fn is_not_found(error: &OciDistributionError) -> bool {
    match error {
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|e| {
            matches!(
                e.code,
                OciErrorCode::BlobUnknown | OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown
            )
        }),
        OciDistributionError::RequestError(e) => e.status().map(|s| s.as_u16()) == Some(404),
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        _ => false,
    }
}

fn is_manifest_like(media_type: &str) -> bool {
    media_type::is_manifest(media_type) || media_type::is_index(media_type)
}
