//! Lightweight HTTP client for talking to the cluster API server: fetching
//! and patching Pod/Node objects that the node-slice and pod-cleanup
//! controllers need, over `KUBECONFIG`-style bearer auth.

use crate::error::{ControllerError, Result};
use ipam_core::k8s_openapi::api::core::v1::{Node, Pod};
use reqwest::Client;
use tracing::debug;

pub struct ClusterClient {
    base_url: String,
    client: Client,
}

impl ClusterClient {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(token) = bearer_token {
            let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .expect("service account token must be a valid header value");
            value.set_sensitive(true);
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        let client = builder
            .build()
            .map_err(ControllerError::ClusterApi)?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        );
        debug!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ControllerError::not_found(format!(
                "pod {}/{}",
                namespace, name
            )));
        }
        Ok(resp.error_for_status()?.json::<Pod>().await?)
    }

    pub async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let url = format!(
            "{}/api/v1/pods?fieldSelector=spec.nodeName={}",
            self.base_url, node_name
        );
        debug!("GET {}", url);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        #[derive(serde::Deserialize)]
        struct PodList {
            items: Vec<Pod>,
        }
        Ok(resp.json::<PodList>().await?.items)
    }

    pub async fn get_node(&self, name: &str) -> Result<Node> {
        let url = format!("{}/api/v1/nodes/{}", self.base_url, name);
        debug!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ControllerError::not_found(format!("node {}", name)));
        }
        Ok(resp.error_for_status()?.json::<Node>().await?)
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let url = format!("{}/api/v1/nodes", self.base_url);
        debug!("GET {}", url);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        #[derive(serde::Deserialize)]
        struct NodeList {
            items: Vec<Node>,
        }
        Ok(resp.json::<NodeList>().await?.items)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
