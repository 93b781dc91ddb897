mod controller;
mod dispatch;
