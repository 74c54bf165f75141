//! S3-compatible object storage client
//!
//! Path-style addressing (`<endpoint>/<bucket>/<key>`). Endpoints without a
//! scheme are reached over HTTPS.

use crate::common::{cancellable, Error, Result, S3Config};
use crate::s3::sigv4::{sha256_hex, uri_encode, CanonicalRequest, Signer, EMPTY_PAYLOAD_SHA256};
use bytes::Bytes;
use reqwest::{Method, StatusCode, Url};
use tokio_util::sync::CancellationToken;

/// Longest error body echoed back in error messages
const MAX_ERROR_BODY: usize = 512;

pub struct S3Client {
    http: reqwest::Client,
    base: Url,
    host: String,
    bucket: String,
    signer: Signer,
    cancel: CancellationToken,
}

impl S3Client {
    /// Build the client and make sure the bucket exists
    pub async fn connect(config: &S3Config, cancel: CancellationToken) -> Result<Self> {
        let base = endpoint_url(&config.endpoint)?;
        let host = match (base.host_str(), base.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(Error::InvalidConfig(format!(
                    "S3 endpoint {:?} has no host",
                    config.endpoint
                )))
            }
        };

        let mut builder = reqwest::Client::builder();
        if let Some(ca_path) = &config.endpoint_ca {
            let pem = cancellable(&cancel, async {
                tokio::fs::read(ca_path).await.map_err(|e| {
                    Error::Tls(format!("reading S3 endpoint CA {}: {}", ca_path.display(), e))
                })
            })
            .await?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Tls(format!("invalid S3 endpoint CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if config.skip_verify {
            tracing::warn!("S3 TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = Self {
            http: builder.build()?,
            base,
            host,
            bucket: config.bucket.clone(),
            signer: Signer::new(&config.access_key, &config.secret_key, &config.region),
            cancel,
        };

        client.ensure_bucket().await?;
        tracing::info!(
            "Connected to S3 endpoint {} (bucket {})",
            config.endpoint,
            config.bucket
        );
        Ok(client)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let resp = self.send(Method::HEAD, None, Bytes::new(), &[]).await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::Operation(format!(
                "S3 bucket {} does not exist",
                self.bucket
            ))),
            _ => Err(status_error(resp).await),
        }
    }

    /// Upload an object, attaching `x-amz-meta-*` headers
    pub async fn put_object(&self, key: &str, body: Bytes, metadata: &[(&str, &str)]) -> Result<()> {
        let headers: Vec<(String, String)> = metadata
            .iter()
            .map(|(k, v)| (format!("x-amz-meta-{}", k.to_ascii_lowercase()), v.to_string()))
            .collect();
        let size = body.len();

        let resp = self.send(Method::PUT, Some(key), body, &headers).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        tracing::debug!("Uploaded s3://{}/{} ({} bytes)", self.bucket, key, size);
        Ok(())
    }

    pub async fn object_exists(&self, key: &str) -> Result<bool> {
        let resp = self.send(Method::HEAD, Some(key), Bytes::new(), &[]).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(resp).await),
        }
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        let resp = self.send(Method::DELETE, Some(key), Bytes::new(), &[]).await?;
        // S3 answers 204 for deletes, some implementations 200
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        tracing::debug!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        body: Bytes,
        extra_headers: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let path = match key {
            Some(key) => format!(
                "/{}/{}",
                uri_encode(&self.bucket, true),
                uri_encode(key, false)
            ),
            None => format!("/{}", uri_encode(&self.bucket, true)),
        };
        let url = self
            .base
            .join(&path)
            .map_err(|e| Error::InvalidConfig(format!("invalid S3 object path {}: {}", path, e)))?;

        let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let payload_sha256 = if body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            sha256_hex(&body)
        };

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_sha256.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.extend(extra_headers.iter().cloned());

        let authorization = self.signer.authorization(
            &amz_date,
            &CanonicalRequest {
                method: method.as_str(),
                path: &path,
                query: "",
                headers: headers.clone(),
                payload_sha256: &payload_sha256,
            },
        );

        let mut request = self.http.request(method.clone(), url);
        for (name, value) in headers.iter().filter(|(name, _)| name != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request.header(reqwest::header::AUTHORIZATION, authorization);
        if method == Method::PUT {
            request = request.body(body);
        }

        tracing::debug!("S3 {} {}", method, path);
        cancellable(&self.cancel, async { Ok(request.send().await?) }).await
    }
}

fn endpoint_url(endpoint: &str) -> Result<Url> {
    let raw = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    };
    let url = Url::parse(&raw)
        .map_err(|e| Error::InvalidConfig(format!("invalid S3 endpoint {:?}: {}", endpoint, e)))?;
    if url.path() != "/" {
        return Err(Error::InvalidConfig(format!(
            "S3 endpoint {:?} must not contain a path",
            endpoint
        )));
    }
    Ok(url)
}

async fn status_error(resp: reqwest::Response) -> Error {
    let status = resp.status().as_u16();
    let mut message = resp.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    if message.is_empty() {
        message = "empty response body".to_string();
    }
    Error::S3 { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            endpoint_url("s3.amazonaws.com").unwrap().as_str(),
            "https://s3.amazonaws.com/"
        );
        assert_eq!(
            endpoint_url("http://127.0.0.1:9000").unwrap().as_str(),
            "http://127.0.0.1:9000/"
        );
        assert!(endpoint_url("http://minio:9000/prefix").is_err());
        assert!(endpoint_url("http://").is_err());
    }
}
