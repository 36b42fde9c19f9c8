pub mod config_dto;
pub mod job_dto;
pub mod launcher_dto;
pub mod portal_dto;
pub mod topology_dto;
