use vertdb_verticadb::crd::VerticaDB;

use kube::CustomResourceExt;

fn main() {
    for crd in [VerticaDB::crd()] {
        // safe unwrap: we know CRD is serializable
        print!("---\n{}\n", serde_yaml::to_string(&crd).unwrap());
    }
}
