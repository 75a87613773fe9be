use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadAnimationError {
    #[error("error reading scene container")]
    Fbx(#[from] binrw::Error),
}

#[derive(Debug, Error)]
pub enum WriteVmdError {
    #[error("error writing motion data")]
    Binrw(#[from] binrw::Error),
}
