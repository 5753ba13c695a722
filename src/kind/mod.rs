/// kind cluster bootstrap and image preloading
pub mod cluster;
pub mod images;

pub use cluster::KindCluster;
pub use images::ImagePreloader;
