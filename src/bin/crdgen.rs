use kube::CustomResourceExt;
use pki_operator::crd::{Certificate, KeyPair};

fn main() {
    print!("{}", serde_yaml::to_string(&KeyPair::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&Certificate::crd()).unwrap());
}
