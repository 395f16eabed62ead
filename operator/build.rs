use arl_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    // Vendored protoc; the build must not depend on a system install.
    unsafe {
        std::env::set_var("PROTOC", protobuf_src::protoc());
    }
    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/sidecar.proto"], &["proto"])
        .expect("compile sidecar proto");
    println!("cargo:rerun-if-changed=proto/sidecar.proto");

    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/arl.dev_pools_crd.yaml",
        serde_yaml::to_string(&Pool::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/arl.dev_workspaces_crd.yaml",
        serde_yaml::to_string(&Workspace::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/arl.dev_tasks_crd.yaml",
        serde_yaml::to_string(&Task::crd()).unwrap(),
    )
    .unwrap();
}
