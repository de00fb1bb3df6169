pub mod article;
pub mod daemon;
pub mod node;
pub mod planet;
