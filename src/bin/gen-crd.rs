use kube::CustomResourceExt;
use kubext::crd::cluster::Cluster;
use kubext::crd::extension::{Extension, ExtensionVersion};
use kubext::crd::installplan::InstallPlan;

fn main() -> anyhow::Result<()> {
    // Prints a multi-document YAML stream, ready for `kubectl apply -f -`
    let crds = [
        InstallPlan::crd(),
        Extension::crd(),
        ExtensionVersion::crd(),
        Cluster::crd(),
    ];

    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
