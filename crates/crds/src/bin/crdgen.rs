//! Print the JetStream CRDs as a multi-document YAML stream
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crds.yaml`

use crds::{Account, Consumer, Stream, StreamTemplate};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        Account::crd(),
        Stream::crd(),
        Consumer::crd(),
        StreamTemplate::crd(),
    ];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
