//! Sykli CI pipeline for kubext
//!
//! Run locally: sykli run
//! Or: cargo run --bin sykli --features sykli -- --emit | sykli run -

use sykli::{Condition, Pipeline, Template};

fn main() {
    let mut p = Pipeline::new();

    // === RESOURCES ===
    let src = p.dir(".");
    let cargo_registry = p.cache("cargo-registry");
    let cargo_git = p.cache("cargo-git");
    let target_cache = p.cache("target");

    // === TEMPLATE ===
    // Common Rust container configuration
    let rust = Template::new()
        .container("rust:1.85")
        .mount_dir(&src, "/src")
        .mount_cache(&cargo_registry, "/usr/local/cargo/registry")
        .mount_cache(&cargo_git, "/usr/local/cargo/git")
        .mount_cache(&target_cache, "/src/target")
        .workdir("/src");

    // === TASKS ===

    // Test - run all tests
    let _ = p
        .task("test")
        .from(&rust)
        .run("cargo test --all-features")
        .inputs(&["**/*.rs", "Cargo.toml", "Cargo.lock"]);

    // Lint - run clippy with strict warnings
    let _ = p
        .task("lint")
        .from(&rust)
        .run("cargo clippy --all-targets --all-features -- -D warnings")
        .inputs(&["**/*.rs", "Cargo.toml", "Cargo.lock"]);

    // Format check - verify code formatting
    let _ = p
        .task("fmt")
        .from(&rust)
        .run("cargo fmt -- --check")
        .inputs(&["**/*.rs"]);

    // Build release binary (depends on test, lint, fmt)
    let _ = p
        .task("build")
        .from(&rust)
        .run("cargo build --release --bin kubext")
        .inputs(&["**/*.rs", "Cargo.toml", "Cargo.lock"])
        .output("binary", "target/release/kubext")
        .after(&["test", "lint", "fmt"]);

    // Integration tests with kind cluster
    // Only run on push events (not draft PRs) - requires k8s environment
    let _ = p
        .task("integration-test")
        .container("ghcr.io/sykli/kind-runner:latest")
        .mount(&src, "/src")
        .workdir("/src")
        .run(
            r#"#!/bin/bash
set -e

kind create cluster --name kubext-ci

# Generate and install kubext CRDs
cargo run --bin gen-crd > /tmp/kubext-crds.yaml
kubectl apply -f /tmp/kubext-crds.yaml

RUST_LOG=info ./target/release/kubext 2>&1 | tee /tmp/kubext-log.txt &
KUBEXT_PID=$!
sleep 5

cat <<EOF | kubectl apply -f -
apiVersion: kubext.io/v1alpha1
kind: Extension
metadata:
  name: demo
spec:
  displayName: Demo
---
apiVersion: kubext.io/v1alpha1
kind: InstallPlan
metadata:
  name: demo
spec:
  extension:
    name: demo
    version: 1.0.0
  config: |
    replicas: 1
EOF

sleep 10

# The finalizer is added on the first reconcile
FINALIZERS=$(kubectl get installplan demo -o jsonpath='{.metadata.finalizers[0]}')
if [ "$FINALIZERS" != "kubext.io/installplan-protection" ]; then
  echo "ERROR: expected finalizer, got '$FINALIZERS'"
  cat /tmp/kubext-log.txt
  exit 1
fi

# ExtensionVersion demo-1.0.0 does not exist, so the host branch fails the attempt
STATE=$(kubectl get installplan demo -o jsonpath='{.status.installationStatus.state}')
if [ "$STATE" != "InstallFailed" ]; then
  echo "ERROR: expected InstallFailed, got '$STATE'"
  cat /tmp/kubext-log.txt
  exit 1
fi

# Deleting a plan that never installed a release must not hang
kubectl delete installplan demo --timeout=30s

echo "Integration tests passed!"

kill $KUBEXT_PID || true
kind delete cluster --name kubext-ci || true
"#,
        )
        .input_from("build", "binary", "/src/target/release/kubext")
        .when_cond(Condition::event("push").or(Condition::negate(Condition::branch("*"))))
        .timeout(600); // 10 minute timeout

    p.emit();
}
