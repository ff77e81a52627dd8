//! Multi-node fixtures.

pub mod mesh;

pub use mesh::MeshFixture;
