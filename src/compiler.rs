//! Compiler service boundary: named sources + referenced binaries in,
//! binary + symbols or diagnostics out. Deterministic, no side effects.

use crate::error::RuntimeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// One compiler finding with enough source context to display and fix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct CompileRequest {
    /// Module or query name the artifact is built for.
    pub name: String,
    /// Named source texts. The reference backend expects exactly one.
    pub sources: BTreeMap<String, String>,
    /// Already-compiled binaries the sources may depend on.
    pub references: Vec<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct CompiledArtifact {
    pub binary: Vec<u8>,
    pub symbols: Option<Vec<u8>>,
    /// SHA-256 over every input; cache key for precompiled artifacts.
    pub content_hash: String,
}

/// Content hash over name, sources (in name order), and references.
pub fn content_hash(name: &str, sources: &BTreeMap<String, String>, references: &[Vec<u8>]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    for (source_name, text) in sources {
        hasher.update([0u8]);
        hasher.update(source_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
    }
    for reference in references {
        hasher.update([1u8]);
        hasher.update(reference);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[async_trait]
pub trait CompilerService: Send + Sync {
    async fn compile(&self, request: &CompileRequest) -> Result<CompiledArtifact, RuntimeError>;
}

/// Reference backend: assembles one WebAssembly text source into a wasm
/// binary. References are accepted for hash/caching purposes; linking happens
/// at instantiation time inside the owning load context.
pub struct WatCompiler;

#[async_trait]
impl CompilerService for WatCompiler {
    async fn compile(&self, request: &CompileRequest) -> Result<CompiledArtifact, RuntimeError> {
        if request.sources.len() != 1 {
            let diagnostic = Diagnostic {
                code: "WAT000".into(),
                message: format!(
                    "expected exactly one module source, got {}",
                    request.sources.len()
                ),
                source_name: request.name.clone(),
                line: None,
                column: None,
            };
            return Err(RuntimeError::CompilationFailed(vec![diagnostic]));
        }
        let Some((source_name, text)) = request.sources.iter().next() else {
            return Err(RuntimeError::CompilationFailed(vec![Diagnostic {
                code: "WAT000".into(),
                message: "no module source supplied".into(),
                source_name: request.name.clone(),
                line: None,
                column: None,
            }]));
        };
        let binary = wat::parse_str(text).map_err(|e| {
            RuntimeError::CompilationFailed(vec![Diagnostic {
                code: "WAT001".into(),
                // The assembler reports byte offsets inside the message.
                message: e.to_string(),
                source_name: source_name.clone(),
                line: None,
                column: None,
            }])
        })?;
        let content_hash = content_hash(&request.name, &request.sources, &request.references);
        Ok(CompiledArtifact {
            binary,
            symbols: None,
            content_hash,
        })
    }
}

/// Decorator that serves repeat requests from an in-process cache keyed by
/// the content hash of the inputs, so an unchanged connection definition
/// never hits the backend twice.
pub struct CachingCompiler<C> {
    inner: C,
    cache: Mutex<BTreeMap<String, CompiledArtifact>>,
}

impl<C: CompilerService> CachingCompiler<C> {
    pub fn new(inner: C) -> Self {
        CachingCompiler {
            inner,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl<C: CompilerService> CompilerService for CachingCompiler<C> {
    async fn compile(&self, request: &CompileRequest) -> Result<CompiledArtifact, RuntimeError> {
        let key = content_hash(&request.name, &request.sources, &request.references);
        if let Ok(cache) = self.cache.lock() {
            if let Some(artifact) = cache.get(&key) {
                return Ok(artifact.clone());
            }
        }
        let artifact = self.inner.compile(request).await?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, artifact.clone());
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(name: &str, text: &str) -> CompileRequest {
        let mut sources = BTreeMap::new();
        sources.insert(format!("{}.wat", name), text.to_string());
        CompileRequest {
            name: name.to_string(),
            sources,
            references: Vec::new(),
        }
    }

    #[tokio::test]
    async fn assembles_a_minimal_module() {
        let artifact = WatCompiler
            .compile(&request("empty", "(module)"))
            .await
            .expect("empty module should assemble");
        assert!(artifact.binary.starts_with(b"\0asm"));
        assert_eq!(artifact.content_hash.len(), 64);
    }

    #[tokio::test]
    async fn reports_diagnostics_for_broken_source() {
        let err = WatCompiler
            .compile(&request("broken", "(module (func $x unknown.op))"))
            .await
            .expect_err("broken source must fail");
        match err {
            RuntimeError::CompilationFailed(diags) => {
                assert_eq!(diags.len(), 1);
                assert_eq!(diags[0].code, "WAT001");
                assert!(diags[0].source_name.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rejects_multi_source_requests() {
        let mut req = request("multi", "(module)");
        req.sources.insert("extra.wat".into(), "(module)".into());
        let err = WatCompiler.compile(&req).await.expect_err("must fail");
        assert!(matches!(err, RuntimeError::CompilationFailed(_)));
    }

    struct CountingCompiler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompilerService for CountingCompiler {
        async fn compile(&self, request: &CompileRequest) -> Result<CompiledArtifact, RuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            WatCompiler.compile(request).await
        }
    }

    #[tokio::test]
    async fn cache_serves_identical_inputs_without_recompiling() {
        let caching = CachingCompiler::new(CountingCompiler {
            calls: AtomicUsize::new(0),
        });
        let req = request("cached", "(module)");
        let first = caching.compile(&req).await.expect("compile");
        let second = caching.compile(&req).await.expect("compile");
        assert_eq!(first.binary, second.binary);
        assert_eq!(caching.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(caching.cached_len(), 1);
    }
}
