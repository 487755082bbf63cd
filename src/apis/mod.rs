pub mod postgrescluster_types;
