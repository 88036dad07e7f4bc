mod backup;
mod helpers;
